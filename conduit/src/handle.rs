//! Lifetime handle for a running context task.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle for controlling a context's listener task.
///
/// Dropping the handle closes the shutdown channel, which stops the task the
/// same way [`stop`](Self::stop) does, without waiting for it.
#[derive(Debug)]
pub struct ContextHandle {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ContextHandle {
    /// Spawn `run`, handing it the shutdown receiver it must select on.
    pub(crate) fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(run(shutdown_rx));
        debug!(context = name, "context started");
        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    /// Context name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        self.join().await;
    }

    /// Wait for the task to end on its own.
    pub async fn join(self) {
        if self.task.await.is_err_and(|e| e.is_panic()) {
            warn!(context = self.name, "context task panicked");
        }
    }

    /// Tear the context down immediately, like closing its window.
    pub fn abort(&self) {
        self.task.abort();
    }
}
