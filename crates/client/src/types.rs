//! Shared types for the closure pipeline.
//!
//! These are the shapes persisted in the local outbox and passed between the
//! orchestrator, the sync engine and the notifier. They must stay
//! serialization-compatible with records written by older builds, so every
//! field added after the first release carries `#[serde(default)]`.

use chrono::{DateTime, Utc};
use fieldops_core::{OutboxId, TicketId, UserId};
use fieldops_tickets::{FormData, SelectedPart};
use serde::{Deserialize, Serialize};

/// Highest replay failure count an outbox item may reach before it is dropped.
pub const MAX_RETRIES: u32 = 5;

/// Optional petty-cash line recorded with a closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseEntry {
    pub amount: f64,
    #[serde(default)]
    pub description: String,
}

impl ExpenseEntry {
    pub fn new(amount: f64, description: impl Into<String>) -> Self {
        Self {
            amount,
            description: description.into(),
        }
    }

    /// Only positive amounts are written to the backend.
    pub fn is_billable(&self) -> bool {
        self.amount.is_finite() && self.amount > 0.0
    }
}

/// Everything needed to materialize a closure against the backend later.
///
/// Stored as the JSON `data` column of an outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosurePayload {
    pub selected_parts: Vec<SelectedPart>,
    pub form_answers: FormData,
    pub closed_at: DateTime<Utc>,
    pub repair_cost: f64,
    pub repair_duration: Option<i64>,
    #[serde(default)]
    pub technician_id: Option<UserId>,
    #[serde(default)]
    pub labor_cost: f64,
    #[serde(default)]
    pub expense: Option<ExpenseEntry>,
}

impl ClosurePayload {
    pub fn maintenance_cost(&self) -> f64 {
        fieldops_tickets::maintenance_cost(self.repair_cost, self.labor_cost)
    }
}

/// A closure queued on the device, waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClosure {
    pub id: OutboxId,
    pub ticket_id: TicketId,
    pub payload: ClosurePayload,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and able to reach the backend.
    Online,
    /// Offline (network unreachable or backend unavailable).
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_release_payload_still_decodes() {
        // Payloads written before technician/labor/expense were recorded.
        let raw = json!({
            "selectedParts": [],
            "formAnswers": {"notes": "done"},
            "closedAt": "2026-01-05T10:00:00Z",
            "repairCost": 0.0,
            "repairDuration": null
        });
        let payload: ClosurePayload = serde_json::from_value(raw).unwrap();
        assert!(payload.technician_id.is_none());
        assert_eq!(payload.labor_cost, 0.0);
        assert!(payload.expense.is_none());
    }

    #[test]
    fn expense_needs_positive_amount() {
        assert!(ExpenseEntry::new(12.5, "fuel").is_billable());
        assert!(!ExpenseEntry::new(0.0, "nothing").is_billable());
        assert!(!ExpenseEntry::new(-3.0, "refund").is_billable());
    }
}
