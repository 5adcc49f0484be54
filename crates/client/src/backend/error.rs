//! Backend error model and the single place raw errors are classified.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of backend-signaled failure classes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// A row the operation needs is locked by another transaction.
    ResourceBusy,
    /// The ticket is not in a status that allows the operation.
    WorkflowViolation,
    /// The operation was already applied.
    Duplicate,
    Generic,
}

impl BackendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::ResourceBusy => "resource_busy",
            BackendErrorKind::WorkflowViolation => "workflow_violation",
            BackendErrorKind::Duplicate => "duplicate",
            BackendErrorKind::Generic => "generic",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendErrorKind::ResourceBusy)
    }
}

impl core::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body as returned by the REST layer, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBackendError {
    #[serde(skip)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl RawBackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Translate into one of the closed error kinds.
    ///
    /// SQLSTATE codes take precedence; message text is only consulted for
    /// errors raised by the procedures themselves (`P0001`) or without a code.
    pub fn classify(&self) -> BackendErrorKind {
        match self.code.as_deref() {
            // lock_not_available, serialization_failure, deadlock_detected
            Some("55P03" | "40001" | "40P01") => return BackendErrorKind::ResourceBusy,
            // unique_violation
            Some("23505") => return BackendErrorKind::Duplicate,
            Some("P0001") | None => {}
            Some(_) => return self.classify_by_status(),
        }

        let text = format!(
            "{} {}",
            self.message.to_lowercase(),
            self.details.as_deref().unwrap_or_default().to_lowercase()
        );

        if ["lock", "busy", "being updated", "try again"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            BackendErrorKind::ResourceBusy
        } else if ["duplicate", "already consumed", "already applied", "already recorded"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            BackendErrorKind::Duplicate
        } else if ["workflow", "status", "not in progress", "not allowed"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            BackendErrorKind::WorkflowViolation
        } else {
            self.classify_by_status()
        }
    }

    fn classify_by_status(&self) -> BackendErrorKind {
        match self.status {
            Some(423) => BackendErrorKind::ResourceBusy,
            Some(409) => BackendErrorKind::Duplicate,
            _ => BackendErrorKind::Generic,
        }
    }
}

/// Any failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("{kind}: {message}")]
    Rejected {
        kind: BackendErrorKind,
        message: String,
        code: Option<String>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("backend unreachable")]
    Offline,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn rejected(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// Backend-signaled class, if the backend answered at all.
    pub fn kind(&self) -> Option<BackendErrorKind> {
        match self {
            BackendError::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Timeouts, aborts and unreachable hosts.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout | BackendError::Offline | BackendError::Transport(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            BackendError::Rejected { kind, .. } => match kind {
                BackendErrorKind::ResourceBusy => {
                    "This part is being updated by someone else. Please try again in a moment."
                        .to_string()
                }
                BackendErrorKind::WorkflowViolation => {
                    "This ticket is no longer in a state that allows closing it.".to_string()
                }
                BackendErrorKind::Duplicate => {
                    "These parts were already recorded for this ticket.".to_string()
                }
                BackendErrorKind::Generic => {
                    "The server could not complete the closure.".to_string()
                }
            },
            BackendError::Timeout => "The server took too long to respond.".to_string(),
            BackendError::Offline => "No connection to the server.".to_string(),
            BackendError::Transport(_) => "A network error interrupted the request.".to_string(),
            BackendError::NotFound(what) => format!("{what} was not found."),
            BackendError::Decode(_) => "The server sent an unexpected response.".to_string(),
        }
    }
}

impl From<RawBackendError> for BackendError {
    fn from(raw: RawBackendError) -> Self {
        let kind = raw.classify();
        tracing::debug!(
            code = raw.code.as_deref().unwrap_or(""),
            status = raw.status,
            %kind,
            "classified backend error"
        );
        BackendError::Rejected {
            kind,
            message: raw.message,
            code: raw.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_codes_win_over_message_text() {
        let raw = RawBackendError::new("duplicate key value").with_code("55P03");
        assert_eq!(raw.classify(), BackendErrorKind::ResourceBusy);

        let raw = RawBackendError::new("status whatever").with_code("23505");
        assert_eq!(raw.classify(), BackendErrorKind::Duplicate);
    }

    #[test]
    fn raised_exceptions_are_classified_by_message() {
        let busy = RawBackendError::new("Part row is locked, try again").with_code("P0001");
        let workflow =
            RawBackendError::new("Ticket status must be in_progress").with_code("P0001");
        let duplicate =
            RawBackendError::new("Part already consumed for this ticket").with_code("P0001");
        let generic = RawBackendError::new("insufficient stock").with_code("P0001");

        assert_eq!(busy.classify(), BackendErrorKind::ResourceBusy);
        assert_eq!(workflow.classify(), BackendErrorKind::WorkflowViolation);
        assert_eq!(duplicate.classify(), BackendErrorKind::Duplicate);
        assert_eq!(generic.classify(), BackendErrorKind::Generic);
    }

    #[test]
    fn unknown_codes_fall_back_to_http_status() {
        let raw = RawBackendError::new("conflict").with_code("XX000").with_status(409);
        assert_eq!(raw.classify(), BackendErrorKind::Duplicate);

        let raw = RawBackendError::new("boom").with_code("XX000").with_status(500);
        assert_eq!(raw.classify(), BackendErrorKind::Generic);
    }

    #[test]
    fn each_class_has_its_own_message() {
        let kinds = [
            BackendErrorKind::ResourceBusy,
            BackendErrorKind::WorkflowViolation,
            BackendErrorKind::Duplicate,
            BackendErrorKind::Generic,
        ];
        let mut messages: Vec<String> = kinds
            .iter()
            .map(|k| BackendError::rejected(*k, "x").user_message())
            .collect();
        messages.push(BackendError::Timeout.user_message());
        messages.push(BackendError::Offline.user_message());

        let unique: std::collections::HashSet<_> = messages.iter().collect();
        assert_eq!(unique.len(), messages.len());
    }

    #[test]
    fn only_resource_busy_is_retryable() {
        assert!(BackendErrorKind::ResourceBusy.is_retryable());
        assert!(!BackendErrorKind::WorkflowViolation.is_retryable());
        assert!(!BackendErrorKind::Duplicate.is_retryable());
        assert!(BackendError::Timeout.is_transport());
        assert_eq!(BackendError::Timeout.kind(), None);
    }
}
