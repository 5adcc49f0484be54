//! User-visible signals leaving the closure pipeline.
//!
//! The pipeline never talks to a UI directly; it hands [`Notice`]s to a
//! [`Notifier`]. The agent binary logs them, a UI shell subscribes to a
//! [`ChannelNotifier`].

use fieldops_core::TicketId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::backend::BackendErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    ClosureCommitted { ticket_id: TicketId },
    ClosureQueued { ticket_id: TicketId },
    ResourceBusy,
    WorkflowViolation,
    Duplicate,
    Failed { message: String },
    StorageQuotaExceeded,
    SyncSucceeded { count: usize },
    SyncFailed { count: usize },
    SyncDataLost { ticket_id: TicketId },
}

impl Notice {
    /// Notice for a backend-signaled rejection.
    pub fn for_kind(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        match kind {
            BackendErrorKind::ResourceBusy => Notice::ResourceBusy,
            BackendErrorKind::WorkflowViolation => Notice::WorkflowViolation,
            BackendErrorKind::Duplicate => Notice::Duplicate,
            BackendErrorKind::Generic => Notice::Failed {
                message: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            Notice::ClosureCommitted { .. } | Notice::ClosureQueued { .. } | Notice::SyncSucceeded { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            Notice::ClosureCommitted { .. } => "Job closed successfully.".to_string(),
            Notice::ClosureQueued { .. } => {
                "You are offline. The closure was saved and will sync when you reconnect."
                    .to_string()
            }
            Notice::ResourceBusy => {
                "This part is being updated by someone else. Please try again in a moment."
                    .to_string()
            }
            Notice::WorkflowViolation => {
                "This ticket is no longer in a state that allows closing it.".to_string()
            }
            Notice::Duplicate => "These parts were already recorded for this ticket.".to_string(),
            Notice::Failed { message } => format!("The closure could not be completed: {message}"),
            Notice::StorageQuotaExceeded => {
                "Device storage is full. The closure could not be saved offline.".to_string()
            }
            Notice::SyncSucceeded { count } => format!("{count} offline closure(s) synced."),
            Notice::SyncFailed { count } => {
                format!("{count} offline closure(s) failed to sync and will be retried.")
            }
            Notice::SyncDataLost { ticket_id } => format!(
                "A saved closure for ticket {ticket_id} could not be synced after repeated attempts and was discarded."
            ),
        }
    }
}

impl core::fmt::Display for Notice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message())
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        if notice.is_error() {
            tracing::warn!(?notice, "{notice}");
        } else {
            tracing::info!(?notice, "{notice}");
        }
    }
}

/// Fans notices out to any number of subscribers.
///
/// Notices sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notice>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}
