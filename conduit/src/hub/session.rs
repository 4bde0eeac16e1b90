//! Session-scoped state of one background-script lifetime.
//!
//! The hub owns exactly one [`HubSession`]; a fresh session models a fresh
//! background script, which is how tests get isolation without simulating
//! extension reloads.

use crate::popup::{PopupGate, PopupPhase};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Whether the page script has been injected during this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionState {
    /// No `Init` has been served yet.
    #[default]
    NotLoaded,
    /// The page script was injected; further `Init`s are no-ops.
    Loaded,
}

/// State that lives exactly as long as the background context.
#[derive(Debug)]
pub struct HubSession {
    injection: Mutex<InjectionState>,
    popup: Arc<PopupGate>,
}

impl Default for HubSession {
    fn default() -> Self {
        Self::new()
    }
}

impl HubSession {
    /// A fresh session: nothing injected, no popup pending.
    #[must_use]
    pub fn new() -> Self {
        Self {
            injection: Mutex::new(InjectionState::NotLoaded),
            popup: PopupGate::new(),
        }
    }

    /// Current injection state.
    #[must_use]
    pub fn injection(&self) -> InjectionState {
        *self.injection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `NotLoaded → Loaded`.
    ///
    /// Returns `true` only for the caller that performed the transition;
    /// that caller is responsible for the actual injection.
    pub fn begin_injection(&self) -> bool {
        let mut state = self.injection.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InjectionState::Loaded {
            return false;
        }
        *state = InjectionState::Loaded;
        true
    }

    /// Undo a transition whose injection failed, so a later `Init` retries.
    pub fn abort_injection(&self) {
        *self.injection.lock().unwrap_or_else(PoisonError::into_inner) = InjectionState::NotLoaded;
        debug!("injection rolled back");
    }

    /// The single-popup gate.
    #[must_use]
    pub const fn popup_gate(&self) -> &Arc<PopupGate> {
        &self.popup
    }

    /// Current popup phase.
    #[must_use]
    pub fn popup_phase(&self) -> PopupPhase {
        self.popup.phase()
    }
}
