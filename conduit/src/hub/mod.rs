//! Background router / hub.
//!
//! The hub is the only long-lived coordinator. It owns the handler registry,
//! answers runtime messages through the handler registered for their type,
//! broadcasts events to tabs and drives the popup lifecycle.
//!
//! Every dispatched message is answered exactly once: a handler result
//! becomes a Response, a handler failure becomes an Error carrying the
//! triggering correlation id. Messages of a type nobody handles are dropped.

mod handlers;
pub mod session;

pub use session::{HubSession, InjectionState};

use crate::browser::{BrowserHost, TabInfo, WindowId};
use crate::config::HubConfig;
use crate::envelope::{Envelope, ErrorReply, Event, Message, MessageType, Response};
use crate::error::{HubError, HubResult, TransportError};
use crate::transport::{
    ExtensionRuntime, MessageSender, RuntimeClient, RuntimeListener, RuntimePort, RuntimeRequest,
};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Future returned by a message handler.
pub type HandlerFuture = BoxFuture<'static, HubResult<Value>>;

/// A message handler.
pub type Handler = Arc<dyn Fn(Message, MessageSender) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message, MessageSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResult<Value>> + Send + 'static,
{
    Arc::new(move |message, sender| Box::pin(f(message, sender)))
}

/// Identifies one registration, so a stale owner cannot remove a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

/// Hub statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    /// Messages handed to a handler.
    pub dispatched: u64,
    /// Messages dropped for lack of a handler.
    pub dropped: u64,
    /// Handler failures answered with an Error.
    pub failed: u64,
    /// Popup windows opened.
    pub popups_opened: u64,
    /// Events delivered to tabs.
    pub events_delivered: u64,
}

/// The background hub.
#[derive(Clone)]
pub struct BackgroundHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    browser: Arc<dyn BrowserHost>,
    runtime: ExtensionRuntime,
    session: HubSession,
    handlers: Mutex<HashMap<MessageType, Subscription>>,
    next_id: AtomicU64,
    stats: Mutex<HubStats>,
}

impl std::fmt::Debug for BackgroundHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundHub")
            .field("config", &self.inner.config)
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl BackgroundHub {
    /// Create a hub with a fresh session and the built-in handlers for
    /// `Init` and every prompt-requiring message type.
    #[must_use]
    pub fn new(
        config: HubConfig,
        browser: Arc<dyn BrowserHost>,
        runtime: &ExtensionRuntime,
    ) -> Self {
        let hub = Self {
            inner: Arc::new(HubInner {
                config,
                browser,
                runtime: runtime.clone(),
                session: HubSession::new(),
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stats: Mutex::new(HubStats::default()),
            }),
        };
        handlers::install(&hub);
        hub
    }

    fn downgrade(&self) -> Weak<HubInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<HubInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, HashMap<MessageType, Subscription>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut HubStats)) {
        f(&mut self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Register the handler for `message_type`; the last registration wins.
    pub fn subscribe(&self, message_type: MessageType, handler: Handler) -> SubscriptionId {
        self.register(message_type, handler, false)
    }

    /// Register a handler that removes itself after its first invocation.
    pub fn handle_once(&self, message_type: MessageType, handler: Handler) -> SubscriptionId {
        self.register(message_type, handler, true)
    }

    fn register(&self, message_type: MessageType, handler: Handler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self.handlers().insert(
            message_type,
            Subscription { id, handler, once },
        );
        if previous.is_some() {
            debug!(%message_type, "handler replaced");
        } else {
            trace!(%message_type, once, "handler registered");
        }
        id
    }

    /// Remove the registration `id` for `message_type`.
    ///
    /// Does nothing if a newer registration has replaced it.
    pub fn unsubscribe(&self, message_type: MessageType, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers();
        if handlers.get(&message_type).is_some_and(|s| s.id == id) {
            handlers.remove(&message_type);
            return true;
        }
        false
    }

    /// Whether any handler is registered for `message_type`.
    #[must_use]
    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers().contains_key(&message_type)
    }

    fn take_handler(&self, message_type: MessageType) -> Option<Handler> {
        let mut handlers = self.handlers();
        let once = handlers.get(&message_type)?.once;
        if once {
            handlers.remove(&message_type).map(|s| s.handler)
        } else {
            handlers.get(&message_type).map(|s| Arc::clone(&s.handler))
        }
    }

    /// Run the handler registered for the message's type.
    ///
    /// Returns `None` when no handler is registered.
    pub async fn dispatch(
        &self,
        message: Message,
        sender: MessageSender,
    ) -> Option<HubResult<Value>> {
        let message_type = message.message_type;
        let Some(handler) = self.take_handler(message_type) else {
            debug!(%message_type, id = %message.correlation_id, "no handler, message dropped");
            self.record(|s| s.dropped += 1);
            return None;
        };

        self.record(|s| s.dispatched += 1);
        let result = handler(message, sender).await;
        if result.is_err() {
            self.record(|s| s.failed += 1);
        }
        Some(result)
    }

    /// Serve one runtime message, answering through its responder.
    pub async fn handle_request(&self, request: RuntimeRequest) {
        let RuntimeRequest {
            envelope,
            sender,
            responder,
        } = request;

        let Some(Envelope::Message(message)) = Envelope::from_value(&envelope) else {
            trace!("ignoring foreign runtime traffic");
            return;
        };
        let id = message.correlation_id;
        let message_type = message.message_type;

        let reply = match self.dispatch(message, sender).await {
            Some(Ok(payload)) => Envelope::from(Response {
                correlation_id: id,
                payload,
            }),
            Some(Err(e)) => {
                warn!(%id, %message_type, error = %e, "handler failed");
                Envelope::from(ErrorReply::new(id, e.to_string()))
            }
            None => return,
        };

        if !responder.respond(reply.to_value()) {
            debug!(%id, "sender gone before reply");
        }
    }

    /// Serve the background listener until the runtime goes away.
    ///
    /// Each message is served on its own task so a handler waiting on the
    /// user never blocks the loop.
    pub async fn run(&self, mut listener: RuntimeListener) {
        info!("background hub running");
        while let Some(request) = listener.recv().await {
            let hub = self.clone();
            tokio::spawn(async move { hub.handle_request(request).await });
        }
        info!("runtime closed, background hub stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    #[must_use]
    pub fn start(&self, listener: RuntimeListener) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move { hub.run(listener).await })
    }

    /// Send a message into the extension pages and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns the transport failure, [`HubError::Rejected`] when a page
    /// answered with an Error, or a malformed-reply error.
    ///
    pub async fn publish_message(&self, message: Message) -> HubResult<Value> {
        trace!(id = %message.correlation_id, "publishing into extension pages");
        Self::publish_via(&self.inner.runtime.background_port(), message).await
    }

    /// Send a message to the page loaded in popup `window` only.
    ///
    /// # Errors
    ///
    /// As [`publish_message`](Self::publish_message); a window with no page
    /// listening yields [`TransportError::NoReceiver`].
    pub async fn publish_to_window(&self, window: WindowId, message: Message) -> HubResult<Value> {
        trace!(id = %message.correlation_id, window, "publishing into popup window");
        Self::publish_via(&self.inner.runtime.window_port(window), message).await
    }

    async fn publish_via(port: &RuntimeClient, message: Message) -> HubResult<Value> {
        let id = message.correlation_id;
        let reply = port.send_message(Envelope::from(message).to_value()).await?;

        match Envelope::from_value(&reply) {
            Some(Envelope::Response(r)) if r.correlation_id == id => Ok(r.payload),
            Some(Envelope::Error(e)) if e.correlation_id == id => Err(HubError::Rejected(e.error)),
            _ => Err(TransportError::Malformed(
                "reply does not answer the published message".into(),
            )
            .into()),
        }
    }

    /// Deliver an event to every open tab. Returns the number of tabs reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the tab list cannot be read.
    pub async fn broadcast(&self, event: Event) -> HubResult<usize> {
        self.broadcast_where(event, |_| true).await
    }

    /// Deliver an event to the tabs whose origin matches `url`'s origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the tab list cannot be read.
    pub async fn broadcast_to_url(&self, event: Event, url: &Url) -> HubResult<usize> {
        let origin = url.origin();
        self.broadcast_where(event, move |tab| tab.url.origin() == origin)
            .await
    }

    async fn broadcast_where(
        &self,
        event: Event,
        matches: impl Fn(&TabInfo) -> bool + Send + Sync,
    ) -> HubResult<usize> {
        let event_type = event.event_type;
        let value = Envelope::from(event).to_value();
        let tabs = self.inner.browser.tabs().await?;

        let mut delivered = 0usize;
        for tab in tabs.iter().filter(|t| matches(t)) {
            match self.inner.browser.send_to_tab(tab.id, value.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(tab = tab.id, %event_type, error = %e, "event not delivered"),
            }
        }

        debug!(%event_type, delivered, "event broadcast");
        self.record(|s| s.events_delivered += delivered as u64);
        Ok(delivered)
    }

    /// This background lifetime's session state.
    #[must_use]
    pub fn session(&self) -> &HubSession {
        &self.inner.session
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Browser host the hub drives.
    #[must_use]
    pub fn browser(&self) -> &Arc<dyn BrowserHost> {
        &self.inner.browser
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        *self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MemoryBrowser;
    use crate::envelope::EventType;
    use crate::filter;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn hub() -> (BackgroundHub, MemoryBrowser, ExtensionRuntime) {
        let browser = MemoryBrowser::new();
        let runtime = ExtensionRuntime::new();
        let hub = BackgroundHub::new(HubConfig::default(), Arc::new(browser.clone()), &runtime);
        (hub, browser, runtime)
    }

    #[tokio::test]
    async fn test_subscribe_last_write_wins() {
        let (hub, _, _) = hub();
        hub.subscribe(MessageType::GetAddress, handler_fn(|_, _| async { Ok(json!("first")) }));
        hub.subscribe(MessageType::GetAddress, handler_fn(|_, _| async { Ok(json!("second")) }));

        let res = hub
            .dispatch(Message::new(MessageType::GetAddress), MessageSender::extension_page())
            .await;
        assert_eq!(res, Some(Ok(json!("second"))));
    }

    #[tokio::test]
    async fn test_handle_once_fires_once() {
        let (hub, _, _) = hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        hub.handle_once(
            MessageType::GetNetwork,
            handler_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("mainnet")) }
            }),
        );

        let sender = MessageSender::extension_page();
        let first = hub.dispatch(Message::new(MessageType::GetNetwork), sender.clone()).await;
        let second = hub.dispatch(Message::new(MessageType::GetNetwork), sender).await;

        assert_eq!(first, Some(Ok(json!("mainnet"))));
        assert_eq!(second, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!hub.has_handler(MessageType::GetNetwork));
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_keeps_newer_handler() {
        let (hub, _, _) = hub();
        let old = hub.subscribe(MessageType::GetBalance, handler_fn(|_, _| async { Ok(json!(1)) }));
        let new = hub.subscribe(MessageType::GetBalance, handler_fn(|_, _| async { Ok(json!(2)) }));

        assert!(!hub.unsubscribe(MessageType::GetBalance, old));
        assert!(hub.has_handler(MessageType::GetBalance));
        assert!(hub.unsubscribe(MessageType::GetBalance, new));
        assert!(!hub.has_handler(MessageType::GetBalance));
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_correlated_error() {
        let (hub, _, runtime) = hub();
        hub.subscribe(
            MessageType::GetBalance,
            handler_fn(|_, _| async { Err(HubError::handler("node unreachable")) }),
        );
        let _task = hub.start(runtime.listen_background());

        let msg = Message::new(MessageType::GetBalance);
        let reply = runtime
            .page_port()
            .send_message(Envelope::from(msg.clone()).to_value())
            .await
            .unwrap();

        assert!(filter::is_error(&reply));
        assert_eq!(filter::correlation_id_of(&reply), Some(msg.correlation_id));
        assert_eq!(reply["error"], "node unreachable");
        assert_eq!(hub.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_unhandled_type_is_dropped() {
        let (hub, _, runtime) = hub();
        let _task = hub.start(runtime.listen_background());

        let msg = Message::new(MessageType::Disconnect);
        let res = runtime
            .page_port()
            .send_message(Envelope::from(msg).to_value())
            .await;

        assert_eq!(res, Err(TransportError::PortClosed));
        assert_eq!(hub.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_foreign_runtime_traffic_is_ignored() {
        let (hub, _, runtime) = hub();
        let _task = hub.start(runtime.listen_background());

        let res = runtime.page_port().send_message(json!({"greeting": "hi"})).await;
        assert_eq!(res, Err(TransportError::PortClosed));
        assert_eq!(hub.stats(), HubStats::default());
    }

    #[tokio::test]
    async fn test_broadcast_to_url_filters_by_origin() {
        let (hub, browser, _) = hub();
        let (_, mut dapp) = browser.open_tab(Url::parse("https://dapp.example/app").unwrap());
        let (other_tab, mut other) = browser.open_tab(Url::parse("https://other.example").unwrap());
        let (port_tab, mut dapp_port) =
            browser.open_tab(Url::parse("https://dapp.example:8443").unwrap());

        let event = Event::new(EventType::AccountChanged, json!("0xnew"));
        let reached = hub
            .broadcast_to_url(event, &Url::parse("https://dapp.example").unwrap())
            .await
            .unwrap();
        assert_eq!(reached, 1);

        let got = dapp.recv().await.unwrap();
        assert!(filter::type_filter(EventType::AccountChanged)(&got));
        assert_eq!(got["payload"], "0xnew");

        // A closed inbox with nothing queued proves nothing was delivered.
        browser.close_tab(other_tab.id);
        browser.close_tab(port_tab.id);
        assert!(other.recv().await.is_none());
        assert!(dapp_port.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_tab() {
        let (hub, browser, _) = hub();
        let (_, mut a) = browser.open_tab(Url::parse("https://a.example").unwrap());
        let (_, mut b) = browser.open_tab(Url::parse("https://b.example").unwrap());

        let reached = hub
            .broadcast(Event::new(EventType::NetworkChanged, json!("testnet")))
            .await
            .unwrap();
        assert_eq!(reached, 2);
        assert!(filter::is_event(&a.recv().await.unwrap()));
        assert!(filter::is_event(&b.recv().await.unwrap()));
        assert_eq!(hub.stats().events_delivered, 2);
    }
}
