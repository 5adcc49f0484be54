use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldops_core::{AssetId, DomainError, DomainResult, Role, TicketId};

use crate::closure::FormData;

/// Workflow status of a ticket.
///
/// ```text
/// open -> assigned -> in_progress -> pending_approval -> closed
///                         ^                 |
///                         +---- rejected ---+
/// ```
///
/// Managers and admins may close from `in_progress` directly. Any status before
/// `pending_approval` may be cancelled. `closed` and `cancelled` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Assigned,
    InProgress,
    PendingApproval,
    Closed,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Assigned => "assigned",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::PendingApproval => "pending_approval",
            TicketStatus::Closed => "closed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Closed | TicketStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Open, Assigned)
                | (Assigned, InProgress)
                | (InProgress, PendingApproval)
                | (InProgress, Closed)
                | (PendingApproval, Closed)
                | (PendingApproval, InProgress)
                | (Open, Cancelled)
                | (Assigned, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    /// Validate a transition, returning the new status.
    pub fn transition_to(self, next: TicketStatus) -> DomainResult<TicketStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invalid_transition(self.as_str(), next.as_str()))
        }
    }

    /// Status a closure submitted by `role` moves the ticket to.
    pub fn closure_target(role: Role) -> TicketStatus {
        if role.can_close_directly() {
            TicketStatus::Closed
        } else {
            TicketStatus::PendingApproval
        }
    }
}

impl core::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a backend ticket record.
///
/// The backend is the system of record; the client reads this and writes back
/// a closure update, never anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub status: TicketStatus,
    #[serde(default)]
    pub form_data: FormData,
    #[serde(default)]
    pub repair_cost: Option<f64>,
    #[serde(default)]
    pub maintenance_cost: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repair_duration: Option<i64>,
    #[serde(default)]
    pub asset_id: Option<AssetId>,
}

impl Ticket {
    /// A fresh, open ticket with no asset linkage.
    pub fn new(id: TicketId) -> Self {
        Self {
            id,
            status: TicketStatus::Open,
            form_data: FormData::new(),
            repair_cost: None,
            maintenance_cost: None,
            started_at: None,
            closed_at: None,
            repair_duration: None,
            asset_id: None,
        }
    }

    pub fn with_status(mut self, status: TicketStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_asset(mut self, asset_id: AssetId) -> Self {
        self.asset_id = Some(asset_id);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Parts may only be consumed against a ticket linked to an asset.
    pub fn ensure_asset_linked(&self) -> DomainResult<AssetId> {
        self.asset_id.ok_or_else(|| {
            DomainError::validation("ticket must be linked to an asset before parts are used")
        })
    }
}

/// Serviced asset, as far as closures care about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub purchase_value: Option<f64>,
}

/// Result of checking a part's category against an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "message", rename_all = "snake_case")]
pub enum Compatibility {
    Compatible,
    /// Allowed, but the user should see the message.
    Warning(String),
    /// Not allowed.
    Error(String),
}

impl Compatibility {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Compatibility::Error(_))
    }
}
