//! Envelope model shared by every context.
//!
//! An envelope is the unit exchanged between the page, the content script,
//! the background hub and the popup. On the wire it is a JSON object carrying
//! the [`FILTER_MARKER_KEY`] marker and an explicit `kind` tag:
//!
//! ```json
//! {
//!   "ccFilterMarker": "conduit-wallet-bridge",
//!   "kind": "message",
//!   "correlationId": "6f1c…",
//!   "messageType": "SendTransaction",
//!   "payload": { "to": "0xabc" }
//! }
//! ```

use crate::filter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Key under which every envelope carries its marker.
pub const FILTER_MARKER_KEY: &str = "ccFilterMarker";

/// Marker value identifying conduit envelopes among unrelated page traffic.
pub const FILTER_MARKER: &str = "conduit-wallet-bridge";

/// Identifier pairing a request with its eventual response or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Discriminant carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A request expecting exactly one Response or Error.
    Message,
    /// A broadcast notification, never answered.
    Event,
    /// The successful answer to a Message.
    Response,
    /// The failed answer to a Message.
    Error,
}

impl EnvelopeKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Event => "event",
            Self::Response => "response",
            Self::Error => "error",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "event" => Some(Self::Event),
            "response" => Some(Self::Response),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Closed set of request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Content script announcing itself; triggers page-script injection.
    Init,
    /// Popup UI has mounted and can take the pending request.
    PopupReady,
    /// Ask the user to connect the page to the wallet.
    Connect,
    /// Whether the page is already connected.
    IsConnected,
    /// Current account address.
    GetAddress,
    /// Current account balance.
    GetBalance,
    /// Currently selected network.
    GetNetwork,
    /// Ask the user to sign a transaction.
    SignTransaction,
    /// Ask the user to sign arbitrary data.
    SignData,
    /// Ask the user to sign and submit a transaction.
    SendTransaction,
    /// Drop the page's connection.
    Disconnect,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Init,
        Self::PopupReady,
        Self::Connect,
        Self::IsConnected,
        Self::GetAddress,
        Self::GetBalance,
        Self::GetNetwork,
        Self::SignTransaction,
        Self::SignData,
        Self::SendTransaction,
        Self::Disconnect,
    ];

    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::PopupReady => "PopupReady",
            Self::Connect => "Connect",
            Self::IsConnected => "IsConnected",
            Self::GetAddress => "GetAddress",
            Self::GetBalance => "GetBalance",
            Self::GetNetwork => "GetNetwork",
            Self::SignTransaction => "SignTransaction",
            Self::SignData => "SignData",
            Self::SendTransaction => "SendTransaction",
            Self::Disconnect => "Disconnect",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Types exchanged only between extension contexts, never from a page.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        matches!(self, Self::Init | Self::PopupReady)
    }

    /// Types that need the user to act in a popup window.
    #[must_use]
    pub const fn requires_prompt(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::SignTransaction | Self::SignData | Self::SendTransaction
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of broadcast notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// The selected account changed.
    AccountChanged,
    /// The selected network changed.
    NetworkChanged,
    /// The wallet dropped the page's connection.
    Disconnected,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 3] = [Self::AccountChanged, Self::NetworkChanged, Self::Disconnected];

    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccountChanged => "AccountChanged",
            Self::NetworkChanged => "NetworkChanged",
            Self::Disconnected => "Disconnected",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request addressed to whichever context handles its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Fresh id pairing this request with its answer.
    pub correlation_id: CorrelationId,
    /// Declared type, used for routing.
    pub message_type: MessageType,
    /// Handler-defined payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    /// Create a message without payload and a fresh correlation id.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            message_type,
            payload: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Decode the payload into a concrete type.
    ///
    /// A missing payload decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload has the wrong shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }

    /// Build the successful answer to this message.
    #[must_use]
    pub const fn respond(&self, payload: Value) -> Response {
        Response {
            correlation_id: self.correlation_id,
            payload,
        }
    }

    /// Build the failed answer to this message.
    #[must_use]
    pub fn fail(&self, error: impl Into<String>) -> ErrorReply {
        ErrorReply {
            correlation_id: self.correlation_id,
            error: error.into(),
        }
    }
}

/// Successful answer carrying the handler's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the originating message.
    pub correlation_id: CorrelationId,
    /// Handler result.
    #[serde(default)]
    pub payload: Value,
}

/// Failed answer carrying a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    /// Id of the originating message.
    pub correlation_id: CorrelationId,
    /// Description of the failure.
    pub error: String,
}

impl ErrorReply {
    /// Create an error answer for a known correlation id.
    #[must_use]
    pub fn new(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            error: error.into(),
        }
    }
}

/// Broadcast notification without correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Declared type, used by listeners to select events.
    pub event_type: EventType,
    /// Event data.
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an event.
    #[must_use]
    pub const fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Any conduit envelope, tagged by its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// A request.
    Message(Message),
    /// A broadcast notification.
    Event(Event),
    /// A successful answer.
    Response(Response),
    /// A failed answer.
    Error(ErrorReply),
}

impl Envelope {
    /// Kind discriminant.
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Message(_) => EnvelopeKind::Message,
            Self::Event(_) => EnvelopeKind::Event,
            Self::Response(_) => EnvelopeKind::Response,
            Self::Error(_) => EnvelopeKind::Error,
        }
    }

    /// Correlation id, absent for events.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Message(m) => Some(m.correlation_id),
            Self::Response(r) => Some(r.correlation_id),
            Self::Error(e) => Some(e.correlation_id),
            Self::Event(_) => None,
        }
    }

    /// Encode into the marked JSON wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert(
                FILTER_MARKER_KEY.to_string(),
                Value::String(FILTER_MARKER.to_string()),
            );
        }
        value
    }

    /// Decode an arbitrary value, returning `None` for anything that is not
    /// a well-formed conduit envelope.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        filter::classify(value)?;
        serde_json::from_value(value.clone()).ok()
    }
}

impl From<Message> for Envelope {
    fn from(m: Message) -> Self {
        Self::Message(m)
    }
}

impl From<Event> for Envelope {
    fn from(e: Event) -> Self {
        Self::Event(e)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<ErrorReply> for Envelope {
    fn from(e: ErrorReply) -> Self {
        Self::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = Message::new(MessageType::GetAddress);
        let b = Message::new(MessageType::GetAddress);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::new(MessageType::SendTransaction).with_payload(json!({"to": "0xabc"}));
        let value = Envelope::from(msg.clone()).to_value();

        assert_eq!(value[FILTER_MARKER_KEY], FILTER_MARKER);
        assert_eq!(value["kind"], "message");
        assert_eq!(value["messageType"], "SendTransaction");
        assert_eq!(value["correlationId"], msg.correlation_id.to_string());
        assert_eq!(value["payload"]["to"], "0xabc");
    }

    #[test]
    fn test_message_without_payload_omits_field() {
        let value = Envelope::from(Message::new(MessageType::Init)).to_value();
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_respond_and_fail_keep_correlation() {
        let msg = Message::new(MessageType::SignData);
        assert_eq!(msg.respond(json!("sig")).correlation_id, msg.correlation_id);
        assert_eq!(msg.fail("declined").correlation_id, msg.correlation_id);
    }

    #[test]
    fn test_from_value_requires_marker() {
        let mut value = Envelope::from(Message::new(MessageType::Connect)).to_value();
        assert!(Envelope::from_value(&value).is_some());

        value[FILTER_MARKER_KEY] = json!("someone-else");
        assert!(Envelope::from_value(&value).is_none());
    }

    #[test]
    fn test_from_value_decodes_error() {
        let msg = Message::new(MessageType::Connect);
        let value = Envelope::from(msg.fail("user rejected")).to_value();

        match Envelope::from_value(&value) {
            Some(Envelope::Error(e)) => {
                assert_eq!(e.error, "user rejected");
                assert_eq!(e.correlation_id, msg.correlation_id);
            }
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Tx {
            amount: u64,
        }

        let msg = Message::new(MessageType::SignTransaction).with_payload(json!({"amount": 7}));
        let tx: Tx = msg.payload_as().unwrap();
        assert_eq!(tx.amount, 7);
    }

    #[test]
    fn test_message_type_classes() {
        assert!(MessageType::Init.is_internal());
        assert!(MessageType::PopupReady.is_internal());
        assert!(!MessageType::Connect.is_internal());

        assert!(MessageType::SendTransaction.requires_prompt());
        assert!(!MessageType::GetAddress.requires_prompt());
        assert!(!MessageType::PopupReady.requires_prompt());

        for t in MessageType::ALL {
            assert_eq!(MessageType::from_wire(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        for t in EventType::ALL {
            assert_eq!(EventType::from_wire(t.as_str()), Some(t));
        }
        assert_eq!(EventType::from_wire("accountChanged"), None);
    }
}
