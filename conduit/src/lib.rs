//! Conduit - cross-context messaging core for a browser-extension wallet.
//!
//! A wallet extension runs in four isolated contexts: the dApp page, the
//! content script, the background script and the popup UI. They share no
//! memory and talk only by posting JSON envelopes. This crate provides the
//! protocol and every context's side of it.
//!
//! # Architecture
//!
//! - **Envelopes** ([`envelope`], [`filter`]) - the tagged, marked wire format
//!   and total predicates for picking conduit traffic out of page noise
//! - **Registry** ([`registry`]) - turns a posted request into one awaitable
//!   reply, keyed by correlation id
//! - **Transports** ([`transport`]) - in-page `postMessage` and the extension
//!   runtime channel with one-shot replies
//! - **Contexts** - [`bridge::InjectedBridge`] in the page,
//!   [`content::ContentScript`] as the relay, [`hub::BackgroundHub`] in the
//!   background and [`popup_ui::PopupUi`] in the popup
//! - **Browser** ([`browser`]) - tabs, windows and script injection as seen
//!   from the background
//! - **Gateway** ([`gateway`]) - wires all contexts together in one process
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use conduit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::default();
//!     gateway.start();
//!     gateway.serve_popups(|runtime| {
//!         PopupUi::new(runtime).on(
//!             MessageType::SendTransaction,
//!             handler_fn(|_, _| async { Ok(serde_json::json!("0xhash")) }),
//!         )
//!     });
//!
//!     let tab = gateway.open_tab("https://dapp.example".parse()?).await?;
//!     let bridge = tab.bridge.as_ref().expect("first tab is injected");
//!     let hash = bridge.send_transaction("transfer", serde_json::json!({})).await?;
//!     println!("{hash}");
//!     Ok(())
//! }
//! ```

// Protocol
pub mod envelope;
pub mod error;
pub mod filter;
pub mod registry;
pub mod transport;

// Contexts
pub mod bridge;
pub mod browser;
pub mod content;
pub mod hub;
pub mod popup;
pub mod popup_ui;

// Wiring
pub mod config;
pub mod gateway;
pub mod handle;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error types (centralized)
    pub use crate::error::{
        BridgeError, BridgeResult, ConduitError, ConfigError, ConfigResult, ErrorContext,
        HostError, HostResult, HubError, HubResult, Result, TransportError, TransportResult,
    };

    // Envelopes
    pub use crate::envelope::{
        CorrelationId, Envelope, EnvelopeKind, ErrorReply, Event, EventType, FILTER_MARKER,
        Message, MessageType, Response,
    };
    pub use crate::filter::{TypeSelector, type_filter};

    // Registry
    pub use crate::registry::{Delivery, PendingReply, PromiseRegistry};

    // Transports
    pub use crate::transport::{
        EnvelopeSink, ExtensionRuntime, MessageSender, PageWindow, RuntimePort,
    };

    // Contexts
    pub use crate::bridge::{InjectedBridge, ListenerId, TransactionRequest};
    pub use crate::browser::{BrowserHost, MemoryBrowser, PopupSpec, TabInfo, WindowBounds};
    pub use crate::content::ContentScript;
    pub use crate::hub::{
        BackgroundHub, Handler, HubSession, HubStats, InjectionState, SubscriptionId, handler_fn,
    };
    pub use crate::popup::{PopupPhase, placement};
    pub use crate::popup_ui::PopupUi;

    // Config
    pub use crate::config::{
        ConduitConfig, ConfigIssue, HubConfig, IssueLevel, PopupConfig, config_path,
        load_config, load_config_from, save_config,
    };

    // Gateway
    pub use crate::gateway::{Gateway, GatewayBuilder, GatewayStatus, Tab};
    pub use crate::handle::ContextHandle;
}
