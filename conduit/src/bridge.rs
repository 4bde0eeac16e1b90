//! Injected bridge: the wallet object a dApp page talks to.
//!
//! Every capability method builds one Message, registers it with the page's
//! [`PromiseRegistry`], posts it into the window for the content script and
//! resolves with the correlated Response payload, or fails with the Error's
//! reason verbatim.
//!
//! The bridge's window listener feeds every marked value to the registry and
//! dispatches Events to listeners registered with [`InjectedBridge::on`].

use crate::envelope::{Envelope, Event, EventType, Message, MessageType};
use crate::error::{BridgeError, BridgeResult};
use crate::filter;
use crate::handle::ContextHandle;
use crate::registry::{Delivery, PendingReply, PromiseRegistry};
use crate::transport::{PageSubscription, PageWindow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Callback for page-side wallet events.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Payload of a `SendTransaction` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Transaction kind, as understood by the wallet.
    pub tx_type: String,
    /// Kind-specific body.
    pub payload: Value,
}

type Listeners = Arc<Mutex<HashMap<ListenerId, (EventType, EventListener)>>>;

/// The page-world wallet object.
#[derive(Clone)]
pub struct InjectedBridge {
    window: PageWindow,
    registry: PromiseRegistry,
    listeners: Listeners,
    next_listener: Arc<AtomicU64>,
}

impl std::fmt::Debug for InjectedBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectedBridge")
            .field("window", &self.window)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl InjectedBridge {
    /// Create a bridge posting into `window`.
    #[must_use]
    pub fn new(window: PageWindow) -> Self {
        Self {
            window,
            registry: PromiseRegistry::new(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Requests still awaiting an answer.
    #[must_use]
    pub const fn registry(&self) -> &PromiseRegistry {
        &self.registry
    }

    /// Start the window listener.
    ///
    /// The listener is attached before this returns.
    #[must_use]
    pub fn start(&self) -> ContextHandle {
        let page = self.window.subscribe();
        let bridge = self.clone();
        ContextHandle::spawn("injected-bridge", move |mut shutdown| async move {
            bridge.listen(page, &mut shutdown).await;
        })
    }

    async fn listen(
        self,
        mut page: PageSubscription,
        shutdown: &mut tokio::sync::mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                value = page.recv() => {
                    let Some(value) = value else { break };
                    self.receive(&value);
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!(pending = self.registry.pending_count(), "bridge listener stopped");
    }

    /// Handle one value seen on the window.
    pub fn receive(&self, value: &Value) {
        if !filter::is_base_envelope(value) {
            return;
        }
        if filter::is_event(value) {
            if let Some(Envelope::Event(event)) = Envelope::from_value(value) {
                self.emit(&event);
            }
            return;
        }
        match self.registry.deliver(value) {
            Delivery::Resolved | Delivery::Rejected => {
                trace!(id = ?filter::correlation_id_of(value), "request settled");
            }
            Delivery::Unknown | Delivery::Ignored => {}
        }
    }

    fn emit(&self, event: &Event) {
        let matching: Vec<EventListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(event_type, _)| *event_type == event.event_type)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(event_type = %event.event_type, listeners = matching.len(), "event received");
        for listener in matching {
            listener(event);
        }
    }

    /// Listen for wallet events of one type.
    pub fn on(
        &self,
        event_type: EventType,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (event_type, Arc::new(listener)));
        id
    }

    /// Remove an event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Post a request and return its pending reply without awaiting it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InternalType`] for internal message types and
    /// the transport error if the window is gone.
    pub fn call(
        &self,
        message_type: MessageType,
        payload: Option<Value>,
    ) -> BridgeResult<PendingReply> {
        if message_type.is_internal() {
            return Err(BridgeError::InternalType(message_type.to_string()));
        }
        let mut message = Message::new(message_type);
        message.payload = payload;
        self.registry.send(message, &self.window)
    }

    /// Send a request and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns the Error reason as [`BridgeError::Rejected`], or any failure
    /// of [`call`](Self::call).
    pub async fn request(
        &self,
        message_type: MessageType,
        payload: Option<Value>,
    ) -> BridgeResult<Value> {
        self.call(message_type, payload)?.await
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        message_type: MessageType,
        payload: Option<Value>,
    ) -> BridgeResult<T> {
        let value = self.request(message_type, payload).await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::UnexpectedReply(format!("{message_type}: {e}")))
    }

    /// Ask the user to connect this page. Resolves with the granted accounts.
    ///
    /// # Errors
    ///
    /// Fails if the user declines or the wallet is unreachable.
    pub async fn connect(&self) -> BridgeResult<Vec<String>> {
        self.request_as(MessageType::Connect, None).await
    }

    /// Whether this page is connected.
    ///
    /// # Errors
    ///
    /// Fails if the wallet is unreachable.
    pub async fn is_connected(&self) -> BridgeResult<bool> {
        self.request_as(MessageType::IsConnected, None).await
    }

    /// Address of the selected account.
    ///
    /// # Errors
    ///
    /// Fails if the page is not connected or the wallet is unreachable.
    pub async fn get_address(&self) -> BridgeResult<String> {
        self.request_as(MessageType::GetAddress, None).await
    }

    /// Balance of the selected account, as the wallet formats it.
    ///
    /// # Errors
    ///
    /// Fails if the page is not connected or the wallet is unreachable.
    pub async fn get_balance(&self) -> BridgeResult<Value> {
        self.request(MessageType::GetBalance, None).await
    }

    /// Name of the active network.
    ///
    /// # Errors
    ///
    /// Fails if the wallet is unreachable.
    pub async fn get_network(&self) -> BridgeResult<String> {
        self.request_as(MessageType::GetNetwork, None).await
    }

    /// Ask the user to sign a transaction. Resolves with the signed form.
    ///
    /// # Errors
    ///
    /// Fails if the user declines.
    pub async fn sign_transaction(&self, transaction: Value) -> BridgeResult<Value> {
        self.request(MessageType::SignTransaction, Some(transaction))
            .await
    }

    /// Ask the user to sign arbitrary data. Resolves with the signature.
    ///
    /// # Errors
    ///
    /// Fails if the user declines.
    pub async fn sign_data(&self, data: Value) -> BridgeResult<String> {
        self.request_as(MessageType::SignData, Some(data)).await
    }

    /// Ask the user to sign and submit a transaction. Resolves with its hash.
    ///
    /// # Errors
    ///
    /// Fails if the user declines or submission fails.
    pub async fn send_transaction(
        &self,
        tx_type: impl Into<String>,
        payload: Value,
    ) -> BridgeResult<String> {
        let request = TransactionRequest {
            tx_type: tx_type.into(),
            payload,
        };
        let body = serde_json::to_value(request)
            .map_err(|e| BridgeError::UnexpectedReply(e.to_string()))?;
        self.request_as(MessageType::SendTransaction, Some(body))
            .await
    }

    /// Disconnect this page from the wallet.
    ///
    /// # Errors
    ///
    /// Fails if the wallet is unreachable.
    pub async fn disconnect(&self) -> BridgeResult<()> {
        self.request(MessageType::Disconnect, None).await.map(drop)
    }
}
