//! Remote backend contract.
//!
//! The backend owns tickets, inventory and expense records and is the system
//! of record. The client reaches it through [`Backend`] (records and stored
//! procedures) and [`ObjectStorage`] (photo uploads); [`HttpBackend`] speaks
//! the production REST API, tests use in-memory fakes.

mod error;
mod http;

use async_trait::async_trait;
use fieldops_core::{AssetId, OutboxId, PartId, TicketId, UserId};
use fieldops_tickets::{Asset, Compatibility, FormData, Ticket, TicketStatus};
use serde::{Deserialize, Serialize};

pub use error::{BackendError, BackendErrorKind, RawBackendError};
pub use http::{HttpBackend, HttpBackendConfig};

/// Atomic consumption of one part against a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumePart {
    pub ticket_id: TicketId,
    pub part_id: PartId,
    pub quantity: u32,
    pub technician_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartQuantity {
    pub part_id: PartId,
    pub quantity: u32,
}

/// Batched consumption used when replaying a queued closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumePartsBatch {
    pub ticket_id: TicketId,
    pub technician_id: Option<UserId>,
    /// Lets the backend recognise a batch it has already applied.
    pub idempotency_key: OutboxId,
    pub items: Vec<PartQuantity>,
}

/// Insert-only petty-cash record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub ticket_id: TicketId,
    pub amount: f64,
    pub description: String,
    pub created_by: Option<UserId>,
    /// Set on replay so a retried insert does not create a second record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<OutboxId>,
}

/// The closure write applied to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketUpdate {
    pub ticket_id: TicketId,
    pub status: TicketStatus,
    /// Only apply if the ticket still has this status.
    pub expected_status: Option<TicketStatus>,
    pub form_data: FormData,
    pub closed_at: chrono::DateTime<chrono::Utc>,
    pub repair_cost: f64,
    pub maintenance_cost: f64,
    pub repair_duration: Option<i64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn consume_part(&self, request: &ConsumePart) -> Result<(), BackendError>;

    async fn consume_parts_batch(&self, request: &ConsumePartsBatch) -> Result<(), BackendError>;

    async fn fetch_ticket(&self, ticket_id: TicketId) -> Result<Ticket, BackendError>;

    /// Apply a closure update. A status guard that no longer matches is a
    /// workflow violation.
    async fn update_ticket(&self, update: &TicketUpdate) -> Result<(), BackendError>;

    async fn insert_expense(&self, expense: &NewExpense) -> Result<(), BackendError>;

    async fn fetch_asset(&self, asset_id: AssetId) -> Result<Asset, BackendError>;

    async fn check_compatibility(
        &self,
        asset_id: AssetId,
        part_id: PartId,
    ) -> Result<Compatibility, BackendError>;

    /// Cheap reachability probe.
    async fn health(&self) -> bool;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes` to `path` and return a publicly resolvable URL.
    async fn upload(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError>;
}
