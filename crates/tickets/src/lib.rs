//! Ticket domain module.
//!
//! This crate contains the business rules of a ticket closure, implemented
//! purely as deterministic domain logic (no IO, no HTTP, no storage): the
//! status workflow, cost and duration math, and the form-data merge.

pub mod closure;
pub mod ticket;

pub use closure::{
    ClosureFigures, FormData, SelectedPart, maintenance_cost, merge_form_data, repair_cost,
    repair_duration_minutes,
};
pub use ticket::{Asset, Compatibility, Ticket, TicketStatus};
