//! Popup placement and the single-popup gate.
//!
//! Only one popup may be waiting for its `PopupReady` handshake at a time.
//! The gate is an explicit state machine:
//!
//! ```text
//! Idle ──acquire──▶ AwaitingPopupReady ──turn dropped──▶ Idle
//!                          │   ▲
//!                          └───┘ turn handed to the next queued trigger
//! ```
//!
//! Triggers arriving while a handshake is outstanding queue in FIFO order.

use crate::browser::{PopupSpec, WindowBounds};
use crate::config::PopupConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Place the popup at the top-right corner of the focused window.
///
/// The popup never starts left of the window's own left edge.
#[must_use]
pub fn placement(bounds: WindowBounds, config: &PopupConfig) -> PopupSpec {
    let right = i64::from(bounds.left) + i64::from(bounds.width);
    let left = (right - i64::from(config.width) - i64::from(config.margin))
        .max(i64::from(bounds.left));
    let top = i64::from(bounds.top) + i64::from(config.margin);

    PopupSpec {
        url: config.url.clone(),
        left: i32::try_from(left).unwrap_or(bounds.left),
        top: i32::try_from(top).unwrap_or(bounds.top),
        width: config.width,
        height: config.height,
    }
}

/// Phase of the popup gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopupPhase {
    /// No popup is being opened.
    #[default]
    Idle,
    /// A popup was (or is being) opened and has not signalled readiness.
    AwaitingPopupReady,
}

#[derive(Debug, Default)]
struct GateState {
    phase: PopupPhase,
    waiters: VecDeque<oneshot::Sender<PopupTurn>>,
}

/// Mutual exclusion for popup handshakes.
#[derive(Debug, Default)]
pub struct PopupGate {
    state: Mutex<GateState>,
}

impl PopupGate {
    /// Create an idle gate.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> PopupPhase {
        self.lock().phase
    }

    /// Number of triggers waiting behind the current handshake.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Wait for the right to open a popup.
    ///
    /// Holding the returned turn keeps the gate in `AwaitingPopupReady`;
    /// dropping it passes the gate to the next queued trigger or back to
    /// `Idle`.
    pub async fn acquire(self: &Arc<Self>) -> PopupTurn {
        loop {
            let rx = {
                let mut state = self.lock();
                if state.phase == PopupPhase::Idle {
                    state.phase = PopupPhase::AwaitingPopupReady;
                    trace!("popup gate acquired");
                    return PopupTurn {
                        gate: Arc::clone(self),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                debug!(queued = state.waiters.len(), "popup pending, trigger queued");
                rx
            };

            if let Ok(turn) = rx.await {
                return turn;
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock();
            let next = state.waiters.pop_front();
            if next.is_none() {
                state.phase = PopupPhase::Idle;
                trace!("popup gate idle");
            }
            next
        };

        if let Some(waiter) = next {
            let turn = PopupTurn {
                gate: Arc::clone(self),
            };
            // A waiter that gave up hands the turn straight back; dropping
            // it releases again for the next one.
            if let Err(turn) = waiter.send(turn) {
                drop(turn);
            }
        }
    }
}

/// Exclusive right to run one popup handshake.
#[derive(Debug)]
pub struct PopupTurn {
    gate: Arc<PopupGate>,
}

impl Drop for PopupTurn {
    fn drop(&mut self) {
        self.gate.release();
    }
}
