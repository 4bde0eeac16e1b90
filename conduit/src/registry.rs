//! Request/response correlation.
//!
//! Turns a fire-and-forget post into a single awaitable reply: [`send`]
//! parks a oneshot sender under the message's correlation id, the receive
//! path calls [`deliver`] with whatever arrives, and the first matching
//! Response or Error settles the caller's [`PendingReply`].
//!
//! The protocol has no notion of expiry. A request whose answer never comes
//! stays pending until its owner gives up; callers that need bounded latency
//! use [`PendingReply::with_timeout`].
//!
//! [`send`]: PromiseRegistry::send
//! [`deliver`]: PromiseRegistry::deliver

use crate::envelope::{CorrelationId, Envelope, Message};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::EnvelopeSink;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Settlement = Result<Value, String>;

/// Outcome of handing an incoming value to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A pending request was resolved with a Response.
    Resolved,
    /// A pending request was rejected with an Error.
    Rejected,
    /// A Response or Error for an unknown or already settled id.
    Unknown,
    /// Not a Response or Error; nothing to do.
    Ignored,
}

/// Pending requests of one context, keyed by correlation id.
#[derive(Clone, Default)]
pub struct PromiseRegistry {
    pending: Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Settlement>>>>,
}

impl std::fmt::Debug for PromiseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseRegistry")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl PromiseRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the message and post it through `sink`.
    ///
    /// # Errors
    ///
    /// Returns the transport error if posting fails; the registration is
    /// removed again in that case.
    pub fn send(&self, message: Message, sink: &dyn EnvelopeSink) -> BridgeResult<PendingReply> {
        let id = message.correlation_id;
        let reply = self.register(id);

        trace!(%id, message_type = %message.message_type, "sending message");
        if let Err(e) = sink.post(Envelope::from(message).to_value()) {
            self.forget(id);
            return Err(e.into());
        }
        Ok(reply)
    }

    /// Park a reply slot for `id`.
    #[must_use]
    pub fn register(&self, id: CorrelationId) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        PendingReply {
            id,
            rx,
            registry: self.clone(),
        }
    }

    /// Settle the request matching an incoming Response or Error.
    ///
    /// Settlement is exactly-once: the entry is removed on first delivery,
    /// so any later delivery for the same id is reported as `Unknown`.
    pub fn deliver(&self, value: &Value) -> Delivery {
        let settlement = match Envelope::from_value(value) {
            Some(Envelope::Response(r)) => (r.correlation_id, Ok(r.payload)),
            Some(Envelope::Error(e)) => (e.correlation_id, Err(e.error)),
            _ => return Delivery::Ignored,
        };
        let (id, outcome) = settlement;
        let rejected = outcome.is_err();

        let Some(tx) = self.lock().remove(&id) else {
            debug!(%id, "reply for unknown or settled request dropped");
            return Delivery::Unknown;
        };

        if tx.send(outcome).is_err() {
            trace!(%id, "caller gone before reply");
        }
        if rejected {
            Delivery::Rejected
        } else {
            Delivery::Resolved
        }
    }

    /// Drop the registration for `id`, if any.
    pub fn forget(&self, id: CorrelationId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is still outstanding.
    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Settlement>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Awaitable answer to one sent message.
///
/// Resolves with the Response payload, fails with
/// [`BridgeError::Rejected`] on an Error, or with [`BridgeError::Abandoned`]
/// if the registration was dropped without any answer.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Settlement>,
    registry: PromiseRegistry,
}

impl PendingReply {
    /// Correlation id of the outstanding request.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Wait at most `timeout` for the answer.
    ///
    /// On expiry the registration is removed so a late answer is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TimedOut`] on expiry, otherwise whatever the
    /// reply settles with.
    pub async fn with_timeout(mut self, timeout: Duration) -> BridgeResult<Value> {
        if let Ok(outcome) = tokio::time::timeout(timeout, &mut self).await {
            outcome
        } else {
            self.registry.forget(self.id);
            debug!(id = %self.id, ?timeout, "request timed out");
            Err(BridgeError::TimedOut(timeout))
        }
    }
}

impl Future for PendingReply {
    type Output = BridgeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| match settled {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(BridgeError::Rejected(reason)),
            Err(_) => Err(BridgeError::Abandoned),
        })
    }
}
