//! In-page `postMessage` transport.
//!
//! Everything posted into a window is seen by every listener attached to
//! that window, including the poster itself. Listeners must filter with
//! [`crate::filter`] before acting.

use super::EnvelopeSink;
use crate::error::{TransportError, TransportResult};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

/// A tab's `window`, as seen through `postMessage`.
#[derive(Clone)]
pub struct PageWindow {
    inner: Arc<PageWindowInner>,
}

struct PageWindowInner {
    url: Url,
    /// `None` once the window is closed.
    listeners: Mutex<Option<Vec<mpsc::UnboundedSender<Value>>>>,
}

impl std::fmt::Debug for PageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWindow")
            .field("url", &self.inner.url.as_str())
            .finish_non_exhaustive()
    }
}

impl PageWindow {
    /// Create a window for a page loaded from `url`.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            inner: Arc::new(PageWindowInner {
                url,
                listeners: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Option<Vec<mpsc::UnboundedSender<Value>>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// URL of the loaded page.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Serialized origin of the loaded page.
    #[must_use]
    pub fn origin(&self) -> String {
        self.inner.url.origin().ascii_serialization()
    }

    /// `window.postMessage(value)`.
    ///
    /// Every attached listener gets its own copy, however far behind it is.
    /// Posting with nobody listening is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WindowClosed`] once the window was closed.
    pub fn post_message(&self, value: Value) -> TransportResult<()> {
        let mut guard = self.listeners();
        let listeners = guard.as_mut().ok_or(TransportError::WindowClosed)?;
        listeners.retain(|tx| tx.send(value.clone()).is_ok());
        trace!(url = %self.inner.url, listeners = listeners.len(), "posted into page");
        Ok(())
    }

    /// Attach a `message` listener.
    ///
    /// A subscription taken after [`close`](Self::close) yields nothing.
    #[must_use]
    pub fn subscribe(&self) -> PageSubscription {
        let rx = self.listeners().as_mut().map(|listeners| {
            let (tx, rx) = mpsc::unbounded_channel();
            listeners.push(tx);
            rx
        });
        PageSubscription { rx }
    }

    /// Tear the window down (tab closed or navigated away).
    ///
    /// Every listener's stream ends once it has drained what was posted.
    pub fn close(&self) {
        self.listeners().take();
    }

    /// Whether the window has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.listeners().is_none()
    }
}

impl EnvelopeSink for PageWindow {
    fn post(&self, envelope: Value) -> TransportResult<()> {
        self.post_message(envelope)
    }
}

/// Stream of values posted into a window.
#[derive(Debug)]
pub struct PageSubscription {
    rx: Option<mpsc::UnboundedReceiver<Value>>,
}

impl PageSubscription {
    /// Next posted value, or `None` once the window is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.as_mut()?.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn window() -> PageWindow {
        PageWindow::new(Url::parse("https://dapp.example/swap").unwrap())
    }

    #[tokio::test]
    async fn test_every_listener_sees_every_post() {
        let win = window();
        let mut a = win.subscribe();
        let mut b = win.subscribe();

        win.post_message(json!({"hello": 1})).unwrap();

        assert_eq!(a.recv().await, Some(json!({"hello": 1})));
        assert_eq!(b.recv().await, Some(json!({"hello": 1})));
    }

    #[tokio::test]
    async fn test_slow_listener_sees_every_post() {
        let win = window();
        let mut slow = win.subscribe();

        for i in 0..1000 {
            win.post_message(json!(i)).unwrap();
        }
        for i in 0..1000 {
            assert_eq!(slow.recv().await, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_dropped_listener_is_detached() {
        let win = window();
        drop(win.subscribe());
        let mut live = win.subscribe();

        win.post_message(json!("a")).unwrap();
        assert_eq!(live.recv().await, Some(json!("a")));
        assert_eq!(win.listeners().as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_post_without_listeners_is_fine() {
        assert!(window().post_message(json!("noise")).is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let win = window();
        let mut sub = win.subscribe();
        win.post_message(json!(1)).unwrap();
        win.close();

        assert_eq!(sub.recv().await, Some(json!(1)));
        assert_eq!(sub.recv().await, None);
        assert_eq!(win.post_message(json!(2)), Err(TransportError::WindowClosed));
        assert!(win.is_closed());
    }

    #[test]
    fn test_origin() {
        assert_eq!(window().origin(), "https://dapp.example");
    }
}
