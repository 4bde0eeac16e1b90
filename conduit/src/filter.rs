//! Classification of arbitrary incoming values.
//!
//! Every listener in every context sees unrelated traffic too (third-party
//! `postMessage` calls, other extensions' runtime messages). These predicates
//! are total: anything that is not a well-formed conduit envelope simply
//! classifies as "not ours".

use crate::envelope::{
    CorrelationId, EnvelopeKind, EventType, FILTER_MARKER, FILTER_MARKER_KEY, MessageType,
};
use serde_json::Value;

/// True iff the value carries the conduit marker.
#[must_use]
pub fn is_base_envelope(value: &Value) -> bool {
    value.get(FILTER_MARKER_KEY).and_then(Value::as_str) == Some(FILTER_MARKER)
}

fn kind_of(value: &Value) -> Option<EnvelopeKind> {
    value
        .get("kind")
        .and_then(Value::as_str)
        .and_then(EnvelopeKind::from_wire)
}

fn is_defined(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(|v| !v.is_null())
}

/// A correlated request with a declared message type.
#[must_use]
pub fn is_message(value: &Value) -> bool {
    is_base_envelope(value)
        && kind_of(value) == Some(EnvelopeKind::Message)
        && is_defined(value, "messageType")
        && is_defined(value, "correlationId")
}

/// A broadcast notification; events never carry a correlation id.
#[must_use]
pub fn is_event(value: &Value) -> bool {
    is_base_envelope(value)
        && kind_of(value) == Some(EnvelopeKind::Event)
        && is_defined(value, "eventType")
        && !is_defined(value, "correlationId")
}

/// A successful answer.
#[must_use]
pub fn is_response(value: &Value) -> bool {
    is_base_envelope(value)
        && kind_of(value) == Some(EnvelopeKind::Response)
        && is_defined(value, "correlationId")
}

/// A failed answer.
#[must_use]
pub fn is_error(value: &Value) -> bool {
    is_base_envelope(value)
        && kind_of(value) == Some(EnvelopeKind::Error)
        && is_defined(value, "correlationId")
        && value.get("error").is_some_and(Value::is_string)
}

/// Kind of a well-formed envelope, or `None` for foreign traffic.
#[must_use]
pub fn classify(value: &Value) -> Option<EnvelopeKind> {
    if is_message(value) {
        Some(EnvelopeKind::Message)
    } else if is_event(value) {
        Some(EnvelopeKind::Event)
    } else if is_response(value) {
        Some(EnvelopeKind::Response)
    } else if is_error(value) {
        Some(EnvelopeKind::Error)
    } else {
        None
    }
}

/// Correlation id of a marked envelope.
#[must_use]
pub fn correlation_id_of(value: &Value) -> Option<CorrelationId> {
    if !is_base_envelope(value) {
        return None;
    }
    value
        .get("correlationId")
        .and_then(Value::as_str)
        .and_then(CorrelationId::parse)
}

/// Declared type of a message.
#[must_use]
pub fn message_type_of(value: &Value) -> Option<MessageType> {
    if !is_message(value) {
        return None;
    }
    value
        .get("messageType")
        .and_then(Value::as_str)
        .and_then(MessageType::from_wire)
}

/// Declared type of an event.
#[must_use]
pub fn event_type_of(value: &Value) -> Option<EventType> {
    if !is_event(value) {
        return None;
    }
    value
        .get("eventType")
        .and_then(Value::as_str)
        .and_then(EventType::from_wire)
}

/// Declared type a subscriber selects on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeSelector {
    /// Messages of this type.
    Message(MessageType),
    /// Events of this type.
    Event(EventType),
}

impl From<MessageType> for TypeSelector {
    fn from(t: MessageType) -> Self {
        Self::Message(t)
    }
}

impl From<EventType> for TypeSelector {
    fn from(t: EventType) -> Self {
        Self::Event(t)
    }
}

/// Predicate selecting only envelopes of the given declared type.
pub fn type_filter(selector: impl Into<TypeSelector>) -> impl Fn(&Value) -> bool + Send + Sync {
    let selector = selector.into();
    move |value: &Value| match selector {
        TypeSelector::Message(t) => message_type_of(value) == Some(t),
        TypeSelector::Event(t) => event_type_of(value) == Some(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Event, Message};
    use serde_json::json;

    fn samples() -> Vec<Value> {
        let msg = Message::new(MessageType::SignData).with_payload(json!("hello"));
        vec![
            Envelope::from(msg.clone()).to_value(),
            Envelope::from(msg.respond(json!("0xsig"))).to_value(),
            Envelope::from(msg.fail("nope")).to_value(),
            Envelope::from(Event::new(EventType::AccountChanged, json!("0x1"))).to_value(),
        ]
    }

    #[test]
    fn test_unmarked_values_are_never_ours() {
        let noise = [
            json!(null),
            json!("hello"),
            json!(42),
            json!({"type": "webpackOk"}),
            json!({"kind": "message", "messageType": "Connect", "correlationId": "x"}),
        ];
        for v in &noise {
            assert!(!is_base_envelope(v));
            assert!(!is_message(v));
            assert!(!is_event(v));
            assert!(!is_response(v));
            assert!(!is_error(v));
            assert_eq!(classify(v), None);
        }

        for mut v in samples() {
            v.as_object_mut().unwrap().remove(FILTER_MARKER_KEY);
            assert_eq!(classify(&v), None);
        }
    }

    #[test]
    fn test_kinds_are_mutually_exclusive() {
        for v in samples() {
            let hits = [is_message(&v), is_event(&v), is_response(&v), is_error(&v)]
                .into_iter()
                .filter(|b| *b)
                .count();
            assert_eq!(hits, 1, "{v}");
        }
    }

    #[test]
    fn test_classify() {
        let kinds: Vec<_> = samples().iter().map(classify).collect();
        assert_eq!(
            kinds,
            vec![
                Some(EnvelopeKind::Message),
                Some(EnvelopeKind::Response),
                Some(EnvelopeKind::Error),
                Some(EnvelopeKind::Event),
            ]
        );
    }

    #[test]
    fn test_event_with_correlation_id_is_rejected() {
        let mut v = Envelope::from(Event::new(EventType::Disconnected, json!(null))).to_value();
        v["correlationId"] = json!(CorrelationId::new().to_string());
        assert!(!is_event(&v));
    }

    #[test]
    fn test_type_filter() {
        let sign = type_filter(MessageType::SignData);
        let send = type_filter(MessageType::SendTransaction);
        let account = type_filter(EventType::AccountChanged);
        let values = samples();

        assert!(sign(&values[0]));
        assert!(!send(&values[0]));
        assert!(!sign(&values[1]));
        assert!(account(&values[3]));
        assert!(!account(&values[0]));
    }

    #[test]
    fn test_event_type_of() {
        for t in EventType::ALL {
            let v = Envelope::from(Event::new(t, json!(null))).to_value();
            assert_eq!(event_type_of(&v), Some(t));
        }
        let mut unknown = samples().remove(3);
        unknown["eventType"] = json!("ChainChanged");
        assert_eq!(event_type_of(&unknown), None);
        assert_eq!(event_type_of(&samples()[0]), None);
    }

    #[test]
    fn test_correlation_id_of() {
        let msg = Message::new(MessageType::Connect);
        let v = Envelope::from(msg.clone()).to_value();
        assert_eq!(correlation_id_of(&v), Some(msg.correlation_id));
        assert_eq!(correlation_id_of(&json!({"correlationId": "abc"})), None);
    }
}
