//! Extension runtime message channel.
//!
//! Models `runtime.sendMessage(envelope, callback)`: each send reaches the
//! listeners of the other side and the first [`Responder`] to answer
//! completes the sender's callback. If every listener drops its responder
//! without answering, the sender sees [`TransportError::PortClosed`].
//!
//! Routing:
//!
//! - content scripts and extension pages send to the background listener;
//! - the background sends either to every connected extension page or, via
//!   a window port, only to the page loaded in one popup window.

use crate::browser::{TabInfo, WindowId};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Default capacity of a listener's queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Which kind of context a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// A content script running in a tab.
    ContentScript,
    /// An extension page (popup or fullscreen UI).
    ExtensionPage,
    /// The background script.
    Background,
}

/// Sender information attached to every runtime message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSender {
    /// Originating context.
    pub context: ContextKind,
    /// Originating tab, for content scripts.
    pub tab: Option<TabInfo>,
}

impl MessageSender {
    /// Sender info for a content script in `tab`.
    #[must_use]
    pub const fn content_script(tab: TabInfo) -> Self {
        Self {
            context: ContextKind::ContentScript,
            tab: Some(tab),
        }
    }

    /// Sender info for an extension page.
    #[must_use]
    pub const fn extension_page() -> Self {
        Self {
            context: ContextKind::ExtensionPage,
            tab: None,
        }
    }

    /// Sender info for the background script.
    #[must_use]
    pub const fn background() -> Self {
        Self {
            context: ContextKind::Background,
            tab: None,
        }
    }
}

/// One-shot reply handle shared by every recipient of a message.
#[derive(Debug, Clone)]
pub struct Responder {
    slot: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl Responder {
    fn new(tx: oneshot::Sender<Value>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Answer the message.
    ///
    /// Returns `false` if another recipient answered first or the sender is
    /// gone.
    pub fn respond(self, value: Value) -> bool {
        let tx = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tx.is_some_and(|tx| tx.send(value).is_ok())
    }
}

/// A message as received by a runtime listener.
#[derive(Debug)]
pub struct RuntimeRequest {
    /// The raw value sent; may be foreign traffic.
    pub envelope: Value,
    /// Who sent it.
    pub sender: MessageSender,
    /// Completes the sender's callback.
    pub responder: Responder,
}

/// Receiving end of the runtime channel for one context.
#[derive(Debug)]
pub struct RuntimeListener {
    rx: mpsc::Receiver<RuntimeRequest>,
}

impl RuntimeListener {
    /// Next incoming message, or `None` when the runtime is gone.
    pub async fn recv(&mut self) -> Option<RuntimeRequest> {
        self.rx.recv().await
    }
}

/// Anything that can perform a runtime `sendMessage` with a reply.
#[async_trait]
pub trait RuntimePort: Send + Sync {
    /// Send a value and wait for the first answer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoReceiver`] when nobody listens and
    /// [`TransportError::PortClosed`] when nobody answers.
    async fn send_message(&self, envelope: Value) -> TransportResult<Value>;
}

/// In-memory extension runtime.
#[derive(Clone, Default)]
pub struct ExtensionRuntime {
    inner: Arc<RuntimeInner>,
}

#[derive(Default)]
struct RuntimeInner {
    background: Mutex<Option<mpsc::Sender<RuntimeRequest>>>,
    pages: Mutex<Vec<PageListener>>,
}

struct PageListener {
    /// Popup window the page is loaded in; `None` for a free-standing page.
    window: Option<WindowId>,
    tx: mpsc::Sender<RuntimeRequest>,
}

impl std::fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRuntime").finish_non_exhaustive()
    }
}

impl ExtensionRuntime {
    /// Create a runtime with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the background script's listener, replacing any previous one.
    #[must_use]
    pub fn listen_background(&self) -> RuntimeListener {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        *self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        debug!("background listener attached");
        RuntimeListener { rx }
    }

    /// Attach the listener of an extension page not bound to a popup
    /// window, such as a fullscreen UI tab.
    #[must_use]
    pub fn listen_page(&self) -> RuntimeListener {
        self.attach_page(None)
    }

    /// Attach the listener of the extension page loaded in popup `window`.
    #[must_use]
    pub fn listen_window(&self, window: WindowId) -> RuntimeListener {
        self.attach_page(Some(window))
    }

    fn attach_page(&self, window: Option<WindowId>) -> RuntimeListener {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        self.inner
            .pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PageListener { window, tx });
        debug!(?window, "extension page listener attached");
        RuntimeListener { rx }
    }

    /// Port used by the content script of `tab`.
    #[must_use]
    pub fn content_port(&self, tab: TabInfo) -> RuntimeClient {
        self.client(MessageSender::content_script(tab))
    }

    /// Port used by an extension page.
    #[must_use]
    pub fn page_port(&self) -> RuntimeClient {
        self.client(MessageSender::extension_page())
    }

    /// Port used by the background script to reach every extension page.
    #[must_use]
    pub fn background_port(&self) -> RuntimeClient {
        self.client(MessageSender::background())
    }

    /// Port used by the background script to reach only the page loaded in
    /// popup `window`.
    #[must_use]
    pub fn window_port(&self, window: WindowId) -> RuntimeClient {
        RuntimeClient {
            target: Some(window),
            ..self.client(MessageSender::background())
        }
    }

    fn client(&self, origin: MessageSender) -> RuntimeClient {
        RuntimeClient {
            runtime: self.clone(),
            origin,
            target: None,
        }
    }

    fn recipients(
        &self,
        from: ContextKind,
        target: Option<WindowId>,
    ) -> Vec<mpsc::Sender<RuntimeRequest>> {
        if from == ContextKind::Background {
            let mut pages = self
                .inner
                .pages
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pages.retain(|p| !p.tx.is_closed());
            pages
                .iter()
                .filter(|p| target.is_none() || p.window == target)
                .map(|p| p.tx.clone())
                .collect()
        } else {
            self.inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|tx| !tx.is_closed())
                .cloned()
                .collect()
        }
    }
}

/// A context's handle onto the runtime channel.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    runtime: ExtensionRuntime,
    origin: MessageSender,
    target: Option<WindowId>,
}

impl RuntimeClient {
    /// Sender info attached to everything this client sends.
    #[must_use]
    pub const fn origin(&self) -> &MessageSender {
        &self.origin
    }
}

#[async_trait]
impl RuntimePort for RuntimeClient {
    async fn send_message(&self, envelope: Value) -> TransportResult<Value> {
        let (tx, rx) = oneshot::channel();
        let responder = Responder::new(tx);

        let mut delivered = 0usize;
        for recipient in self.runtime.recipients(self.origin.context, self.target) {
            let request = RuntimeRequest {
                envelope: envelope.clone(),
                sender: self.origin.clone(),
                responder: responder.clone(),
            };
            if recipient.send(request).await.is_ok() {
                delivered += 1;
            }
        }
        drop(responder);

        if delivered == 0 {
            return Err(TransportError::NoReceiver);
        }
        trace!(
            from = ?self.origin.context,
            target = ?self.target,
            delivered,
            "runtime message sent"
        );

        rx.await.map_err(|_| TransportError::PortClosed)
    }
}
