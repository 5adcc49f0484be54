//! Connectivity detection and state management.
//!
//! The monitor is the single owner of the online/offline flag. The closure
//! orchestrator reads it to pick the immediate or deferred path; the sync
//! worker subscribes to it and starts a drain pass whenever the client comes
//! back online.

use std::sync::Arc;

use tokio::sync::watch;

pub use crate::types::ConnectivityState;

/// Shared connectivity state with change notification.
///
/// Cheap to clone; every clone observes and updates the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Online)
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::Offline)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Mark the client as offline.
    pub fn set_offline(&self) {
        self.set(ConnectivityState::Offline);
    }

    /// Mark the client as online.
    pub fn set_online(&self) {
        self.set(ConnectivityState::Online);
    }

    /// Update the state; subscribers are woken only on an actual change.
    pub fn set(&self, state: ConnectivityState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(?state, "connectivity changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    /// Receiver woken on every state change after this call.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}
