//! Transports connecting the isolated contexts.
//!
//! Two one-way primitives carry every envelope:
//!
//! - [`PageWindow`] - the in-page `postMessage` channel shared by the page's
//!   own scripts, the injected bridge and the content script.
//! - [`ExtensionRuntime`] - the extension runtime channel with one-shot reply
//!   semantics, connecting content scripts and extension pages to the
//!   background hub.

pub mod page;
pub mod runtime;

pub use page::{PageSubscription, PageWindow};
pub use runtime::{
    ContextKind, ExtensionRuntime, MessageSender, Responder, RuntimeClient, RuntimeListener,
    RuntimePort, RuntimeRequest,
};

use crate::error::TransportResult;
use serde_json::Value;

/// Fire-and-forget outlet for encoded envelopes.
pub trait EnvelopeSink: Send + Sync {
    /// Post an envelope without waiting for any answer.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying channel is gone.
    fn post(&self, envelope: Value) -> TransportResult<()>;
}
