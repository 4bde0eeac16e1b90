//! Content-script relay.
//!
//! Bridges the page's `postMessage` transport and the extension runtime
//! channel. It carries no wallet logic: page Messages go to the background
//! unmodified, replies come back unmodified, and events pushed to the tab
//! are posted into the page.

use crate::browser::TabInbox;
use crate::envelope::{Envelope, ErrorReply, Message, MessageType};
use crate::error::TransportResult;
use crate::filter;
use crate::handle::ContextHandle;
use crate::transport::{PageSubscription, PageWindow, RuntimePort};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The content script of one tab.
#[derive(Clone)]
pub struct ContentScript {
    window: PageWindow,
    port: Arc<dyn RuntimePort>,
}

impl std::fmt::Debug for ContentScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentScript")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl ContentScript {
    /// Create a relay between `window` and the runtime `port`.
    pub fn new(window: PageWindow, port: impl RuntimePort + 'static) -> Self {
        Self {
            window,
            port: Arc::new(port),
        }
    }

    /// The page window this relay listens on.
    #[must_use]
    pub const fn window(&self) -> &PageWindow {
        &self.window
    }

    /// Announce the content script to the background with `Init`.
    ///
    /// Safe to call on every load; the background injects at most once per
    /// session.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the background is unreachable.
    pub async fn init(&self) -> TransportResult<Value> {
        let init = Envelope::from(Message::new(MessageType::Init)).to_value();
        debug!(url = %self.window.url(), "content script loaded, sending init");
        self.port.send_message(init).await
    }

    /// Forward one page value to the background.
    ///
    /// Returns the value to post back into the page, or `None` when the
    /// value is not a page-originated Message.
    pub async fn relay(&self, value: Value) -> Option<Value> {
        if !filter::is_message(&value) {
            return None;
        }
        let message_type = filter::message_type_of(&value);
        if message_type.is_none_or(MessageType::is_internal) {
            warn!(?message_type, "refusing to relay message from page");
            return None;
        }
        let id = filter::correlation_id_of(&value);

        match self.port.send_message(value).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                let Some(id) = id else {
                    warn!(error = %e, "uncorrelated message lost");
                    return None;
                };
                debug!(%id, error = %e, "background did not answer, failing request");
                Some(Envelope::from(ErrorReply::new(id, e.to_string())).to_value())
            }
        }
    }

    /// Start listening on the page and, if given, on the tab's inbox.
    ///
    /// The page listener is attached before this returns, so anything posted
    /// afterwards is seen.
    #[must_use]
    pub fn start(self, inbox: Option<TabInbox>) -> ContextHandle {
        let page = self.window.subscribe();
        ContextHandle::spawn("content-script", move |mut shutdown| async move {
            self.listen(page, inbox, &mut shutdown).await;
        })
    }

    async fn listen(
        self,
        mut page: PageSubscription,
        mut inbox: Option<TabInbox>,
        shutdown: &mut tokio::sync::mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                value = page.recv() => {
                    let Some(value) = value else {
                        debug!(url = %self.window.url(), "page window closed");
                        break;
                    };
                    if filter::is_message(&value) {
                        let relay = self.clone();
                        tokio::spawn(async move { relay.forward(value).await });
                    }
                }
                pushed = recv_inbox(&mut inbox) => {
                    match pushed {
                        Some(value) => self.push(value),
                        None => {
                            trace!("tab inbox closed");
                            inbox = None;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("content script shutting down");
                    break;
                }
            }
        }
    }

    async fn forward(&self, value: Value) {
        if let Some(reply) = self.relay(value).await {
            if let Err(e) = self.window.post_message(reply) {
                debug!(error = %e, "page gone before reply");
            }
        }
    }

    fn push(&self, value: Value) {
        if !filter::is_event(&value) {
            trace!("ignoring non-event tab traffic");
            return;
        }
        if let Err(e) = self.window.post_message(value) {
            debug!(error = %e, "page gone before event");
        }
    }
}

async fn recv_inbox(inbox: &mut Option<TabInbox>) -> Option<Value> {
    match inbox {
        Some(inbox) => inbox.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserHost, MemoryBrowser};
    use crate::envelope::{Event, EventType};
    use crate::error::TransportError;
    use crate::transport::ExtensionRuntime;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    /// Answers every message with its own payload, recording what it saw.
    #[derive(Default)]
    struct EchoPort(Mutex<Vec<Value>>);

    #[async_trait]
    impl RuntimePort for Arc<EchoPort> {
        async fn send_message(&self, envelope: Value) -> TransportResult<Value> {
            self.0.lock().unwrap().push(envelope.clone());
            let Some(Envelope::Message(msg)) = Envelope::from_value(&envelope) else {
                return Err(TransportError::PortClosed);
            };
            let payload = msg.payload.clone().unwrap_or(Value::Null);
            Ok(Envelope::from(msg.respond(payload)).to_value())
        }
    }

    fn window() -> PageWindow {
        PageWindow::new(Url::parse("https://dapp.example").unwrap())
    }

    #[tokio::test]
    async fn test_relay_forwards_unmodified() {
        let port = Arc::new(EchoPort::default());
        let relay = ContentScript::new(window(), Arc::clone(&port));

        let msg = Message::new(MessageType::GetBalance).with_payload(json!({"asset": "ada"}));
        let sent = Envelope::from(msg.clone()).to_value();
        let reply = relay.relay(sent.clone()).await.unwrap();

        assert_eq!(port.0.lock().unwrap().as_slice(), &[sent]);
        assert!(filter::is_response(&reply));
        assert_eq!(filter::correlation_id_of(&reply), Some(msg.correlation_id));
    }

    #[tokio::test]
    async fn test_relay_skips_noise_and_internal_types() {
        let port = Arc::new(EchoPort::default());
        let relay = ContentScript::new(window(), Arc::clone(&port));

        assert!(relay.relay(json!({"type": "webpack-hmr"})).await.is_none());
        let event = Envelope::from(Event::new(EventType::Disconnected, Value::Null)).to_value();
        assert!(relay.relay(event).await.is_none());
        let forged = Envelope::from(Message::new(MessageType::PopupReady)).to_value();
        assert!(relay.relay(forged).await.is_none());

        assert!(port.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_background_becomes_error() {
        let runtime = ExtensionRuntime::new();
        let relay = ContentScript::new(window(), runtime.page_port());

        let msg = Message::new(MessageType::GetAddress);
        let reply = relay.relay(Envelope::from(msg.clone()).to_value()).await.unwrap();

        assert!(filter::is_error(&reply));
        assert_eq!(filter::correlation_id_of(&reply), Some(msg.correlation_id));
        assert_eq!(reply["error"], TransportError::NoReceiver.to_string());
    }

    #[tokio::test]
    async fn test_started_relay_posts_reply_into_page() {
        let window = window();
        let relay = ContentScript::new(window.clone(), Arc::new(EchoPort::default()));
        let mut page = window.subscribe();
        let handle = relay.start(None);

        let msg = Message::new(MessageType::GetNetwork).with_payload(json!("preprod"));
        window.post_message(Envelope::from(msg.clone()).to_value()).unwrap();

        // First the page sees its own post, then the relayed reply.
        assert!(filter::is_message(&page.recv().await.unwrap()));
        let reply = page.recv().await.unwrap();
        assert_eq!(
            Envelope::from_value(&reply),
            Some(Envelope::from(msg.respond(json!("preprod"))))
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_inbox_events_reach_page() {
        let browser = MemoryBrowser::new();
        let (tab, inbox) = browser.open_tab(Url::parse("https://dapp.example").unwrap());
        let window = window();
        let mut page = window.subscribe();
        let handle = ContentScript::new(window, Arc::new(EchoPort::default())).start(Some(inbox));

        let event =
            Envelope::from(Event::new(EventType::AccountChanged, json!("0xnew"))).to_value();
        browser.send_to_tab(tab.id, json!("noise")).await.unwrap();
        browser.send_to_tab(tab.id, event.clone()).await.unwrap();

        assert_eq!(page.recv().await, Some(event));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_closed_window_ends_relay() {
        let window = window();
        let handle = ContentScript::new(window.clone(), Arc::new(EchoPort::default())).start(None);
        window.close();
        handle.join().await;
    }
}
