//! `fieldops-core`: shared building blocks for the field-service client.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, actor roles and the domain error model.

pub mod error;
pub mod id;
pub mod role;

pub use error::{DomainError, DomainResult};
pub use id::{AssetId, OutboxId, PartId, TicketId, UserId};
pub use role::Role;
