//! In-process gateway wiring every context together.
//!
//! The gateway is the unified entry point that orchestrates:
//! - the extension runtime and the in-memory browser
//! - the background hub and its dispatch loop
//! - one content script and injected bridge per opened tab
//! - popup UIs mounted for every popup window the hub opens

use crate::bridge::InjectedBridge;
use crate::browser::{BrowserHost, MemoryBrowser, TabInfo};
use crate::config::{ConduitConfig, load_config_from};
use crate::content::ContentScript;
use crate::error::{ConduitError, ErrorContext, Result};
use crate::filter;
use crate::handle::ContextHandle;
use crate::hub::{BackgroundHub, HubStats};
use crate::popup_ui::PopupUi;
use crate::transport::{ExtensionRuntime, PageWindow};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Builds the popup UI mounted into each new popup window.
pub type PopupFactory = Arc<dyn Fn(&ExtensionRuntime) -> PopupUi + Send + Sync>;

/// One simulated browser tab with its content script and, once injected,
/// the page's wallet object.
#[derive(Debug)]
pub struct Tab {
    /// Browser-side description.
    pub info: TabInfo,
    /// The page's `window`.
    pub window: PageWindow,
    /// Wallet object, present when the page script was injected here.
    pub bridge: Option<InjectedBridge>,
    relay: ContextHandle,
    bridge_listener: Option<ContextHandle>,
}

impl Tab {
    /// Close the page: listeners stop and the tab leaves the browser.
    pub async fn close(self, browser: &MemoryBrowser) {
        self.window.close();
        browser.close_tab(self.info.id);
        self.relay.join().await;
        if let Some(listener) = self.bridge_listener {
            listener.join().await;
        }
        debug!(tab = self.info.id, "tab closed");
    }
}

/// Gateway that hosts all contexts in one process.
pub struct Gateway {
    config: ConduitConfig,
    runtime: ExtensionRuntime,
    browser: MemoryBrowser,
    hub: BackgroundHub,
    hub_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(ConduitConfig::default())
    }
}

impl Gateway {
    /// Create a gateway with a fresh browser, runtime and hub session.
    #[must_use]
    pub fn new(config: ConduitConfig) -> Self {
        let runtime = ExtensionRuntime::new();
        let browser = MemoryBrowser::new();
        // No UI to render until `serve_popups`: the window closes again.
        browser.on_popup_opened(|browser, window, _| {
            warn!(window, "no popup UI installed, closing window");
            browser.close_window(window);
        });
        let hub = BackgroundHub::new(config.hub.clone(), Arc::new(browser.clone()), &runtime);
        Self {
            config,
            runtime,
            browser,
            hub,
            hub_task: Mutex::new(None),
        }
    }

    /// Get a reference to the background hub.
    #[must_use]
    pub const fn hub(&self) -> &BackgroundHub {
        &self.hub
    }

    /// Get a reference to the browser.
    #[must_use]
    pub const fn browser(&self) -> &MemoryBrowser {
        &self.browser
    }

    /// Get a reference to the extension runtime.
    #[must_use]
    pub const fn runtime(&self) -> &ExtensionRuntime {
        &self.runtime
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ConduitConfig {
        &self.config
    }

    /// Start the background hub. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.hub_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(self.hub.start(self.runtime.listen_background()));
        info!("gateway started");
    }

    /// Whether the hub's dispatch loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.hub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the hub's dispatch loop.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .hub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!("gateway stopped");
        }
    }

    /// Mount a popup UI built by `factory` into every popup window opened
    /// from now on. The window closes once its UI stops.
    pub fn serve_popups(
        &self,
        factory: impl Fn(&ExtensionRuntime) -> PopupUi + Send + Sync + 'static,
    ) {
        let factory: PopupFactory = Arc::new(factory);
        let runtime = self.runtime.clone();
        self.browser.on_popup_opened(move |browser, window, _| {
            let popup = factory(&runtime).in_window(window);
            let browser = browser.clone();
            tokio::spawn(async move {
                match popup.mount().await {
                    // Single-shot popups end on their own after answering.
                    Ok(handle) => handle.join().await,
                    Err(e) => warn!(window, error = %e, "popup failed to mount"),
                }
                browser.close_window(window);
            });
        });
    }

    /// Open a tab on `url`, start its content script and send `Init`.
    ///
    /// # Errors
    ///
    /// Returns an error if the background cannot be reached.
    pub async fn open_tab(&self, url: Url) -> Result<Tab> {
        let (info, inbox) = self.browser.open_tab(url.clone());
        let window = PageWindow::new(url);

        let relay = ContentScript::new(window.clone(), self.runtime.content_port(info.clone()));
        let init = relay.init().await?;
        if filter::is_error(&init) {
            warn!(tab = info.id, error = %init["error"], "init failed");
        }
        let relay = relay.start(Some(inbox));

        let (bridge, bridge_listener) = if self.browser.injections().contains(&info.id) {
            let bridge = InjectedBridge::new(window.clone());
            let listener = bridge.start();
            (Some(bridge), Some(listener))
        } else {
            (None, None)
        };

        debug!(tab = info.id, url = %info.url, injected = bridge.is_some(), "tab ready");
        Ok(Tab {
            info,
            window,
            bridge,
            relay,
            bridge_listener,
        })
    }

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns an error if the browser cannot list its tabs.
    pub async fn status(&self) -> Result<GatewayStatus> {
        let tabs = self.browser.tabs().await?;
        Ok(GatewayStatus {
            running: self.is_running(),
            tabs: tabs.len(),
            injected_tabs: self.browser.injections().len(),
            injection: format!("{:?}", self.hub.session().injection()),
            popup: format!("{:?}", self.hub.session().popup_phase()),
            popups_opened: self.browser.popups().len(),
            hub: self.hub.stats(),
        })
    }
}

/// Gateway status information.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayStatus {
    /// Whether the hub is running.
    pub running: bool,
    /// Open tabs.
    pub tabs: usize,
    /// Tabs the page script was injected into.
    pub injected_tabs: usize,
    /// Injection state of the hub session.
    pub injection: String,
    /// Popup gate phase.
    pub popup: String,
    /// Popup windows created.
    pub popups_opened: usize,
    /// Hub counters.
    pub hub: HubStats,
}

/// Builder for creating a Gateway.
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    config: ConduitConfig,
}

impl GatewayBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: ConduitConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the popup window size.
    #[must_use]
    pub const fn popup_size(mut self, width: u32, height: u32) -> Self {
        self.config.hub.popup.width = width;
        self.config.hub.popup.height = height;
        self
    }

    /// Load configuration from file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub async fn load_config(mut self, path: &Path) -> Result<Self> {
        self.config = load_config_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?;
        if self.config.has_errors() {
            return Err(ConduitError::config(format!(
                "{} has invalid settings",
                path.display()
            )));
        }
        Ok(self)
    }

    /// Build the gateway.
    #[must_use]
    pub fn build(self) -> Gateway {
        Gateway::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use crate::error::{BridgeError, HubError};
    use crate::hub::handler_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_tab_gets_bridge() {
        let gateway = Gateway::default();
        gateway.start();

        let first = gateway.open_tab(Url::parse("https://dapp.example").unwrap()).await.unwrap();
        let second = gateway.open_tab(Url::parse("https://other.example").unwrap()).await.unwrap();

        assert!(first.bridge.is_some());
        assert!(second.bridge.is_none());
        let status = gateway.status().await.unwrap();
        assert_eq!(status.tabs, 2);
        assert_eq!(status.injected_tabs, 1);
        assert_eq!(status.injection, "Loaded");

        second.close(gateway.browser()).await;
        assert_eq!(gateway.status().await.unwrap().tabs, 1);
    }

    #[tokio::test]
    async fn test_served_popup_answers_prompt() {
        let gateway = GatewayBuilder::new().popup_size(360, 640).build();
        gateway.start();
        gateway.serve_popups(|runtime| {
            PopupUi::new(runtime).on(
                MessageType::Connect,
                handler_fn(|_, _| async { Ok(json!(["0xa11ce"])) }),
            )
        });

        let tab = gateway.open_tab(Url::parse("https://dapp.example").unwrap()).await.unwrap();
        let accounts = tab.bridge.as_ref().unwrap().connect().await.unwrap();
        assert_eq!(accounts, vec!["0xa11ce".to_string()]);

        let popups = gateway.browser().popups();
        assert_eq!(popups.len(), 1);
        assert_eq!((popups[0].1.width, popups[0].1.height), (360, 640));
    }

    #[tokio::test]
    async fn test_prompt_before_serve_popups_does_not_wedge() {
        let gateway = Gateway::default();
        gateway.start();
        let tab = gateway.open_tab(Url::parse("https://dapp.example").unwrap()).await.unwrap();
        let bridge = tab.bridge.as_ref().unwrap();

        let err = bridge.connect().await.unwrap_err();
        assert_eq!(err, BridgeError::Rejected(HubError::PopupClosed.to_string()));

        gateway.serve_popups(|runtime| {
            PopupUi::new(runtime).on(
                MessageType::SignData,
                handler_fn(|_, _| async { Ok(json!("0xsig")) }),
            )
        });
        let sig = bridge.sign_data(json!("hello")).await.unwrap();
        assert_eq!(sig, "0xsig");
        assert_eq!(gateway.browser().popups().len(), 2);

        // The answered popup goes away on its own.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(gateway.browser().open_popups().is_empty());
    }

    #[tokio::test]
    async fn test_open_tab_without_hub_fails() {
        let gateway = Gateway::default();
        let res = gateway.open_tab(Url::parse("https://dapp.example").unwrap()).await;
        assert!(matches!(res, Err(ConduitError::Transport(_))));
    }

    #[tokio::test]
    async fn test_builder_reports_missing_config_file() {
        let path = std::env::temp_dir().join("conduit-missing-config.json");
        let err = GatewayBuilder::new().load_config(&path).await.unwrap_err();
        assert!(err.to_string().starts_with("loading "));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let gateway = Gateway::default();
        gateway.start();
        gateway.start();
        assert!(gateway.is_running());
        gateway.shutdown();
        tokio::task::yield_now().await;
        assert!(!gateway.status().await.unwrap().running);
    }
}
