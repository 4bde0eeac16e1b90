//! Browser host boundary: tabs, windows and script injection.
//!
//! The background hub only talks to the browser through [`BrowserHost`].
//! [`MemoryBrowser`] is the in-process implementation used by the gateway,
//! the CLI simulator and the tests.

use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};
use url::Url;

/// Browser tab identifier.
pub type TabId = u32;

/// Browser window identifier.
pub type WindowId = u32;

/// Capacity of a tab's inbox.
const TAB_INBOX_CAPACITY: usize = 64;

/// A browser tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    /// Tab id.
    pub id: TabId,
    /// Window containing the tab.
    pub window_id: WindowId,
    /// Loaded page URL.
    pub url: Url,
}

impl TabInfo {
    /// Describe a tab.
    #[must_use]
    pub const fn new(id: TabId, window_id: WindowId, url: Url) -> Self {
        Self { id, window_id, url }
    }

    /// Serialized origin of the loaded page.
    #[must_use]
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

/// Screen geometry of a browser window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Parameters of a popup window to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupSpec {
    /// Extension page to load.
    pub url: String,
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Tab, window and scripting APIs available to the background context.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// All open tabs.
    async fn tabs(&self) -> HostResult<Vec<TabInfo>>;

    /// The active tab of the focused window.
    async fn active_tab(&self) -> HostResult<TabInfo>;

    /// Deliver a value to the content script of `tab`.
    async fn send_to_tab(&self, tab: TabId, envelope: Value) -> HostResult<()>;

    /// Inject the page-world script into `tab`.
    async fn inject_page_script(&self, tab: TabId) -> HostResult<()>;

    /// Geometry of the last focused browser window.
    async fn last_focused_window(&self) -> HostResult<WindowBounds>;

    /// Open a popup window.
    async fn create_popup(&self, spec: PopupSpec) -> HostResult<WindowId>;

    /// Resolves once `window` is closed, immediately if it is not open.
    async fn window_closed(&self, window: WindowId);
}

/// Values delivered to one tab's content script by the background.
#[derive(Debug)]
pub struct TabInbox {
    rx: mpsc::Receiver<Value>,
}

impl TabInbox {
    /// Next delivered value, or `None` once the tab is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Called after a popup window was created, with the browser that owns it.
pub type PopupHook = Arc<dyn Fn(&MemoryBrowser, WindowId, &PopupSpec) + Send + Sync>;

/// In-memory browser.
#[derive(Clone)]
pub struct MemoryBrowser {
    inner: Arc<MemoryBrowserInner>,
}

struct MemoryBrowserInner {
    state: Mutex<BrowserState>,
    popup_hook: Mutex<Option<PopupHook>>,
    window_closed: Notify,
}

struct BrowserState {
    next_id: u32,
    main_window: WindowId,
    tabs: Vec<(TabInfo, mpsc::Sender<Value>)>,
    active: Option<TabId>,
    focused: Option<WindowBounds>,
    injections: Vec<TabId>,
    popups: Vec<(WindowId, PopupSpec)>,
    open_popups: Vec<WindowId>,
    popup_failure: Option<String>,
    injection_failure: Option<String>,
}

impl std::fmt::Debug for MemoryBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBrowser").finish_non_exhaustive()
    }
}

impl Default for MemoryBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBrowser {
    /// A browser with one focused 1280x800 window and no tabs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBrowserInner {
                state: Mutex::new(BrowserState {
                    next_id: 2,
                    main_window: 1,
                    tabs: Vec::new(),
                    active: None,
                    focused: Some(WindowBounds {
                        left: 0,
                        top: 0,
                        width: 1280,
                        height: 800,
                    }),
                    injections: Vec::new(),
                    popups: Vec::new(),
                    open_popups: Vec::new(),
                    popup_failure: None,
                    injection_failure: None,
                }),
                popup_hook: Mutex::new(None),
                window_closed: Notify::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrowserState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a tab on `url` and make it active.
    #[must_use]
    pub fn open_tab(&self, url: Url) -> (TabInfo, TabInbox) {
        let (tx, rx) = mpsc::channel(TAB_INBOX_CAPACITY);
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let tab = TabInfo::new(id, state.main_window, url);
        state.tabs.push((tab.clone(), tx));
        state.active = Some(id);
        debug!(tab = id, url = %tab.url, "tab opened");
        (tab, TabInbox { rx })
    }

    /// Close a tab; its inbox stream ends.
    pub fn close_tab(&self, tab: TabId) -> bool {
        let mut state = self.state();
        let before = state.tabs.len();
        state.tabs.retain(|(t, _)| t.id != tab);
        if state.active == Some(tab) {
            state.active = None;
        }
        before != state.tabs.len()
    }

    /// Close a popup window, as the user would.
    ///
    /// Returns `false` if the window was not open.
    pub fn close_window(&self, window: WindowId) -> bool {
        let closed = {
            let mut state = self.state();
            let before = state.open_popups.len();
            state.open_popups.retain(|w| *w != window);
            before != state.open_popups.len()
        };
        if closed {
            debug!(window, "popup window closed");
            self.inner.window_closed.notify_waiters();
        }
        closed
    }

    /// Popup windows currently open.
    #[must_use]
    pub fn open_popups(&self) -> Vec<WindowId> {
        self.state().open_popups.clone()
    }

    /// Change which tab is active.
    pub fn activate(&self, tab: Option<TabId>) {
        self.state().active = tab;
    }

    /// Change the focused window geometry; `None` means nothing has focus.
    pub fn set_focused_window(&self, bounds: Option<WindowBounds>) {
        self.state().focused = bounds;
    }

    /// Make every popup creation fail with `reason`, or succeed again.
    pub fn fail_popups(&self, reason: Option<&str>) {
        self.state().popup_failure = reason.map(str::to_string);
    }

    /// Make every script injection fail with `reason`, or succeed again.
    pub fn fail_injections(&self, reason: Option<&str>) {
        self.state().injection_failure = reason.map(str::to_string);
    }

    /// Install a hook invoked for every created popup, replacing the
    /// previous one.
    pub fn on_popup_opened(
        &self,
        hook: impl Fn(&Self, WindowId, &PopupSpec) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .popup_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Tabs the page script was injected into, in order.
    #[must_use]
    pub fn injections(&self) -> Vec<TabId> {
        self.state().injections.clone()
    }

    /// Popups created so far, in order.
    #[must_use]
    pub fn popups(&self) -> Vec<(WindowId, PopupSpec)> {
        self.state().popups.clone()
    }
}

#[async_trait]
impl BrowserHost for MemoryBrowser {
    async fn tabs(&self) -> HostResult<Vec<TabInfo>> {
        Ok(self.state().tabs.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn active_tab(&self) -> HostResult<TabInfo> {
        let state = self.state();
        let active = state.active.ok_or(HostError::NoActiveTab)?;
        state
            .tabs
            .iter()
            .find(|(t, _)| t.id == active)
            .map(|(t, _)| t.clone())
            .ok_or(HostError::NoActiveTab)
    }

    async fn send_to_tab(&self, tab: TabId, envelope: Value) -> HostResult<()> {
        let tx = self
            .state()
            .tabs
            .iter()
            .find(|(t, _)| t.id == tab)
            .map(|(_, tx)| tx.clone())
            .ok_or(HostError::TabNotFound(tab))?;
        tx.send(envelope)
            .await
            .map_err(|_| HostError::TabNotFound(tab))
    }

    async fn inject_page_script(&self, tab: TabId) -> HostResult<()> {
        let mut state = self.state();
        if let Some(reason) = &state.injection_failure {
            return Err(HostError::Injection(reason.clone()));
        }
        if !state.tabs.iter().any(|(t, _)| t.id == tab) {
            return Err(HostError::TabNotFound(tab));
        }
        state.injections.push(tab);
        info!(tab, "page script injected");
        Ok(())
    }

    async fn last_focused_window(&self) -> HostResult<WindowBounds> {
        self.state().focused.ok_or(HostError::NoFocusedWindow)
    }

    async fn create_popup(&self, spec: PopupSpec) -> HostResult<WindowId> {
        let id = {
            let mut state = self.state();
            if let Some(reason) = &state.popup_failure {
                return Err(HostError::WindowCreation(reason.clone()));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.popups.push((id, spec.clone()));
            state.open_popups.push(id);
            id
        };
        info!(window = id, left = spec.left, top = spec.top, "popup window created");

        let hook = self
            .inner
            .popup_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(self, id, &spec);
        }
        Ok(id)
    }

    async fn window_closed(&self, window: WindowId) {
        loop {
            let notified = self.inner.window_closed.notified();
            tokio::pin!(notified);
            // Register before checking so a close in between is not missed.
            notified.as_mut().enable();
            if !self.state().open_popups.contains(&window) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_tabs_and_active_tab() {
        let browser = MemoryBrowser::new();
        assert_eq!(browser.active_tab().await, Err(HostError::NoActiveTab));

        let (a, _ia) = browser.open_tab(url("https://a.example"));
        let (b, _ib) = browser.open_tab(url("https://b.example"));
        assert_eq!(browser.active_tab().await.unwrap().id, b.id);
        assert_eq!(browser.tabs().await.unwrap().len(), 2);

        browser.activate(Some(a.id));
        assert_eq!(browser.active_tab().await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_send_to_tab() {
        let browser = MemoryBrowser::new();
        let (tab, mut inbox) = browser.open_tab(url("https://a.example"));

        browser.send_to_tab(tab.id, json!("hi")).await.unwrap();
        assert_eq!(inbox.recv().await, Some(json!("hi")));

        assert!(browser.close_tab(tab.id));
        assert_eq!(
            browser.send_to_tab(tab.id, json!("gone")).await,
            Err(HostError::TabNotFound(tab.id))
        );
    }

    #[tokio::test]
    async fn test_popup_failure_and_hook() {
        let browser = MemoryBrowser::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        browser.on_popup_opened(move |_, id, _| sink.lock().unwrap().push(id));

        let spec = PopupSpec {
            url: "popup.html".into(),
            left: 0,
            top: 0,
            width: 400,
            height: 600,
        };
        let id = browser.create_popup(spec.clone()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![id]);

        browser.fail_popups(Some("denied"));
        assert_eq!(
            browser.create_popup(spec).await,
            Err(HostError::WindowCreation("denied".into()))
        );
        assert_eq!(browser.popups().len(), 1);
    }

    #[tokio::test]
    async fn test_window_closed_signal() {
        let browser = MemoryBrowser::new();
        let spec = PopupSpec {
            url: "popup.html".into(),
            left: 0,
            top: 0,
            width: 400,
            height: 600,
        };
        let id = browser.create_popup(spec).await.unwrap();
        assert_eq!(browser.open_popups(), vec![id]);

        let b = browser.clone();
        let waiter = tokio::spawn(async move { b.window_closed(id).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(browser.close_window(id));
        waiter.await.unwrap();
        assert!(!browser.close_window(id));
        assert!(browser.open_popups().is_empty());

        // Already closed: resolves at once.
        browser.window_closed(id).await;
        assert_eq!(browser.popups().len(), 1);
    }

    #[tokio::test]
    async fn test_no_focused_window() {
        let browser = MemoryBrowser::new();
        browser.set_focused_window(None);
        assert_eq!(
            browser.last_focused_window().await,
            Err(HostError::NoFocusedWindow)
        );
    }
}
