//! Outbox drain: replays closures queued while offline.
//!
//! A drain pass takes a snapshot of the outbox and replays every item in
//! submission order:
//!
//! 1. consume the parts in one batch keyed by the outbox id,
//! 2. record the petty-cash expense, if any,
//! 3. upload inline photos and swap in their URLs,
//! 4. re-read the ticket, merge answers and close it.
//!
//! A replay that fails bumps the item's persisted retry counter; reaching the
//! ceiling discards the item and tells the user. Steps 1 and 2 are safe to
//! repeat: the backend recognises the idempotency key and the expense
//! reference, and a `Duplicate` rejection of the batch counts as applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fieldops_tickets::{TicketStatus, merge_form_data};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::backend::{
    Backend, BackendError, BackendErrorKind, ConsumePartsBatch, NewExpense, PartQuantity,
    TicketUpdate,
};
use crate::images::{self, ImageError, ImageUploader};
use crate::notify::{Notice, Notifier};
use crate::outbox::{OutboxError, OutboxStore};
use crate::types::{MAX_RETRIES, PendingClosure};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not read outbox: {0}")]
    Outbox(#[from] OutboxError),
}

/// Why a single item could not be replayed.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    pub committed: usize,
    /// Failed and kept for another attempt.
    pub retrying: usize,
    /// Failed for the last time and discarded.
    pub dropped: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> usize {
        self.retrying + self.dropped
    }
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    uploader: ImageUploader,
    outbox: Arc<dyn OutboxStore>,
    notifier: Arc<dyn Notifier>,
    max_retries: u32,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        uploader: ImageUploader,
        outbox: Arc<dyn OutboxStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            backend,
            uploader,
            outbox,
            notifier,
            max_retries: MAX_RETRIES,
            draining: AtomicBool::new(false),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replay every queued closure once.
    ///
    /// Returns a skipped report without touching the outbox when a pass is
    /// already in flight.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already in progress, skipping");
            return Ok(DrainReport::skipped());
        }
        let _guard = DrainGuard(&self.draining);

        let mut pending = self.outbox.get_all().await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }
        pending.sort_by_key(|item| item.timestamp);
        tracing::info!(count = pending.len(), "draining outbox");

        let mut report = DrainReport::default();
        for item in pending {
            match self.replay(&item).await {
                Ok(()) => {
                    report.committed += 1;
                    if let Err(err) = self.outbox.remove(item.id).await {
                        // Replays are idempotent; the next pass will clear it.
                        tracing::error!(outbox_id = %item.id, "could not remove synced closure: {err}");
                    }
                }
                Err(err) => {
                    if self.record_failure(&item, &err).await {
                        report.dropped += 1;
                    } else {
                        report.retrying += 1;
                    }
                }
            }
        }

        tracing::info!(
            committed = report.committed,
            retrying = report.retrying,
            dropped = report.dropped,
            "drain finished"
        );
        if report.committed > 0 {
            self.notifier.notify(Notice::SyncSucceeded {
                count: report.committed,
            });
        }
        if report.failed() > 0 {
            self.notifier.notify(Notice::SyncFailed {
                count: report.failed(),
            });
        }
        Ok(report)
    }

    async fn replay(&self, item: &PendingClosure) -> Result<(), ReplayError> {
        let ticket_id = item.ticket_id;
        let payload = &item.payload;

        if !payload.selected_parts.is_empty() {
            let batch = ConsumePartsBatch {
                ticket_id,
                technician_id: payload.technician_id,
                idempotency_key: item.id,
                items: payload
                    .selected_parts
                    .iter()
                    .map(|p| PartQuantity {
                        part_id: p.part_id,
                        quantity: p.used_quantity,
                    })
                    .collect(),
            };
            match self.backend.consume_parts_batch(&batch).await {
                Ok(()) => {}
                Err(err) if err.kind() == Some(BackendErrorKind::Duplicate) => {
                    tracing::debug!(outbox_id = %item.id, "parts batch already applied");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(expense) = payload.expense.as_ref().filter(|e| e.is_billable()) {
            self.backend
                .insert_expense(&NewExpense {
                    ticket_id,
                    amount: expense.amount,
                    description: expense.description.clone(),
                    created_by: payload.technician_id,
                    client_ref: Some(item.id),
                })
                .await?;
        }

        let mut answers = payload.form_answers.clone();
        for (key, value) in answers.iter_mut() {
            if !images::is_inline_attachment(value) {
                continue;
            }
            let Value::String(data_url) = &*value else {
                continue;
            };
            let file = images::from_base64(data_url)?;
            let url = self.uploader.upload(ticket_id, &file).await?;
            tracing::debug!(%ticket_id, answer = %key, content_type = %file.content_type, "inline attachment uploaded");
            *value = Value::String(url);
        }

        let current = self.backend.fetch_ticket(ticket_id).await?;
        if current.status == TicketStatus::Closed && closed_by_this_item(&current, item) {
            tracing::info!(%ticket_id, outbox_id = %item.id, "closure already applied");
            return Ok(());
        }
        if !current.status.can_transition_to(TicketStatus::Closed) {
            return Err(BackendError::rejected(
                BackendErrorKind::WorkflowViolation,
                format!("ticket is {} and cannot be closed", current.status),
            )
            .into());
        }

        self.backend
            .update_ticket(&TicketUpdate {
                ticket_id,
                status: TicketStatus::Closed,
                expected_status: Some(current.status),
                form_data: merge_form_data(&current.form_data, &answers),
                closed_at: payload.closed_at,
                repair_cost: payload.repair_cost,
                maintenance_cost: payload.maintenance_cost(),
                repair_duration: payload.repair_duration,
            })
            .await?;

        tracing::info!(%ticket_id, outbox_id = %item.id, "queued closure synced");
        Ok(())
    }

    /// Count a failed replay. Returns `true` when the item was discarded.
    async fn record_failure(&self, item: &PendingClosure, err: &ReplayError) -> bool {
        let attempts = item.retry_count.saturating_add(1);

        if attempts >= self.max_retries {
            tracing::error!(
                ticket_id = %item.ticket_id,
                outbox_id = %item.id,
                attempts,
                "giving up on queued closure: {err}"
            );
            if let Err(remove_err) = self.outbox.remove(item.id).await {
                tracing::error!(outbox_id = %item.id, "could not discard closure: {remove_err}");
            }
            self.notifier.notify(Notice::SyncDataLost {
                ticket_id: item.ticket_id,
            });
            return true;
        }

        tracing::warn!(
            ticket_id = %item.ticket_id,
            outbox_id = %item.id,
            attempts,
            "queued closure failed, will retry: {err}"
        );
        if let Err(store_err) = self.outbox.set_retry_count(item.id, attempts).await {
            tracing::error!(outbox_id = %item.id, "could not persist retry count: {store_err}");
        }
        false
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("max_retries", &self.max_retries)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

/// An earlier attempt closed the ticket but the item was never removed.
fn closed_by_this_item(ticket: &fieldops_tickets::Ticket, item: &PendingClosure) -> bool {
    ticket
        .closed_at
        .is_some_and(|at| (at - item.payload.closed_at).num_milliseconds().abs() < 1_000)
}
