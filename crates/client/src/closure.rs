//! Closure transaction orchestrator.
//!
//! A closure either commits immediately against the backend or, when the
//! client is offline, is queued in the outbox for the sync engine. Every gate
//! (required answers, asset linkage, geofence, workflow status) runs before
//! the first side effect.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use fieldops_core::{DomainError, OutboxId, PartId, Role, UserId};
use fieldops_tickets::{
    ClosureFigures, FormData, SelectedPart, Ticket, TicketStatus, merge_form_data,
};
use serde_json::Value;
use thiserror::Error;

use crate::backend::{Backend, BackendError, BackendErrorKind, ConsumePart, NewExpense, TicketUpdate};
use crate::config::ClientConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::geofence::{DEFAULT_RADIUS_M, GeoPoint, Geolocator, LocationError, PositionProvider};
use crate::images::{self, ImageError, ImageFile, ImageUploader};
use crate::notify::{Notice, Notifier};
use crate::outbox::{OutboxError, OutboxStore};
use crate::types::{ClosurePayload, ExpenseEntry};

/// A filled-in closure form, ready to submit.
#[derive(Debug, Clone)]
pub struct ClosureRequest {
    /// Ticket as loaded when the form was opened.
    pub ticket: Ticket,
    pub submitted_by: UserId,
    pub role: Role,
    pub parts: Vec<SelectedPart>,
    pub answers: FormData,
    /// Answer keys that must be present and non-empty.
    pub required_answers: Vec<String>,
    /// Captured photos keyed by the answer they belong to.
    pub photos: BTreeMap<String, ImageFile>,
    pub labor_cost: f64,
    pub expense: Option<ExpenseEntry>,
    /// Site location; when set, the device must be within the geofence.
    pub site: Option<GeoPoint>,
}

impl ClosureRequest {
    pub fn new(ticket: Ticket, submitted_by: UserId, role: Role) -> Self {
        Self {
            ticket,
            submitted_by,
            role,
            parts: Vec::new(),
            answers: FormData::new(),
            required_answers: Vec::new(),
            photos: BTreeMap::new(),
            labor_cost: 0.0,
            expense: None,
            site: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClosureOutcome {
    /// Applied to the backend; the ticket now has `status`.
    Committed { status: TicketStatus },
    /// Saved in the outbox for later replay.
    Queued { id: OutboxId },
    /// Offline and the device is out of storage; nothing was saved.
    NotQueued,
}

#[derive(Debug, Error)]
pub enum ClosureError {
    #[error("required answer missing: {0}")]
    MissingAnswer(String),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("part {part_id} is not compatible with this asset: {message}")]
    IncompatiblePart { part_id: PartId, message: String },
    #[error("{distance_meters:.0} m from the site, outside the {radius_meters:.0} m geofence")]
    OutsideGeofence {
        distance_meters: f64,
        radius_meters: f64,
    },
    #[error("location: {0}")]
    Location(#[from] LocationError),
    #[error("image: {0}")]
    Image(#[from] ImageError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("outbox: {0}")]
    Outbox(#[from] OutboxError),
}

impl ClosureError {
    pub fn user_message(&self) -> String {
        match self {
            ClosureError::MissingAnswer(key) => format!("Please answer \"{key}\" before closing."),
            ClosureError::Validation(err) => err.to_string(),
            ClosureError::IncompatiblePart { message, .. } => message.clone(),
            ClosureError::OutsideGeofence {
                distance_meters,
                radius_meters,
            } => format!(
                "You are {distance_meters:.0} m from the site. Closures must be submitted within {radius_meters:.0} m."
            ),
            ClosureError::Location(err) => err.user_message().to_string(),
            ClosureError::Image(err) => err.user_message(),
            ClosureError::Backend(err) => err.user_message(),
            ClosureError::Outbox(_) => "The closure could not be saved on this device.".to_string(),
        }
    }
}

/// Sequences validation and the remote steps of a closure.
#[derive(Clone)]
pub struct ClosureOrchestrator {
    backend: Arc<dyn Backend>,
    outbox: Arc<dyn OutboxStore>,
    uploader: ImageUploader,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    locator: Option<Geolocator>,
    geofence_radius: f64,
}

impl ClosureOrchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        outbox: Arc<dyn OutboxStore>,
        uploader: ImageUploader,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            backend,
            outbox,
            uploader,
            connectivity,
            notifier,
            locator: None,
            geofence_radius: DEFAULT_RADIUS_M,
        }
    }

    pub fn with_locator(mut self, locator: Geolocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_geofence_radius(mut self, radius_m: f64) -> Self {
        self.geofence_radius = radius_m;
        self
    }

    /// Enable the geofence gate with the configured radius and location timeout.
    pub fn with_site_checks(self, config: &ClientConfig, positions: Arc<dyn PositionProvider>) -> Self {
        self.with_locator(config.geolocator(positions))
            .with_geofence_radius(config.geofence_radius_m)
    }

    /// Submit a closure.
    ///
    /// Offline submissions that could be stored, or could not be stored for
    /// lack of quota, are reported through the outcome and never as errors.
    pub async fn submit(&self, request: ClosureRequest) -> Result<ClosureOutcome, ClosureError> {
        let ticket_id = request.ticket.id;
        let offline = self.connectivity.is_offline();

        validate(&request, offline)?;
        self.check_geofence(&request).await?;

        if offline {
            return self.enqueue(request).await;
        }

        match self.commit(request).await {
            Ok(status) => {
                tracing::info!(%ticket_id, %status, "closure committed");
                self.notifier.notify(Notice::ClosureCommitted { ticket_id });
                Ok(ClosureOutcome::Committed { status })
            }
            Err(err) => {
                tracing::warn!(%ticket_id, "closure failed: {err}");
                self.report_failure(&err);
                Err(err)
            }
        }
    }

    async fn check_geofence(&self, request: &ClosureRequest) -> Result<(), ClosureError> {
        let Some(site) = request.site else {
            return Ok(());
        };
        let locator = self.locator.as_ref().ok_or_else(|| {
            LocationError::Unavailable("no positioning service configured".to_string())
        })?;

        let result = locator.check_site(site, self.geofence_radius).await?;
        if !result.valid {
            return Err(ClosureError::OutsideGeofence {
                distance_meters: result.distance_meters,
                radius_meters: self.geofence_radius,
            });
        }
        Ok(())
    }

    async fn commit(&self, request: ClosureRequest) -> Result<TicketStatus, ClosureError> {
        let ticket_id = request.ticket.id;
        let target = TicketStatus::closure_target(request.role);
        let mut answers = request.answers;

        // Photos first: nothing is consumed for a closure whose evidence failed.
        for (key, file) in request.photos {
            let file = images::compress_async(file).await;
            let url = self.uploader.upload(ticket_id, &file).await?;
            answers.insert(key, Value::String(url));
        }

        for part in &request.parts {
            self.backend
                .consume_part(&ConsumePart {
                    ticket_id,
                    part_id: part.part_id,
                    quantity: part.used_quantity,
                    technician_id: request.submitted_by,
                })
                .await?;
            tracing::debug!(%ticket_id, part_id = %part.part_id, qty = part.used_quantity, "part consumed");
        }

        if let Some(expense) = request.expense.as_ref().filter(|e| e.is_billable()) {
            self.backend
                .insert_expense(&NewExpense {
                    ticket_id,
                    amount: expense.amount,
                    description: expense.description.clone(),
                    created_by: Some(request.submitted_by),
                    client_ref: None,
                })
                .await?;
        }

        let current = self.backend.fetch_ticket(ticket_id).await?;
        if !current.status.can_transition_to(target) {
            return Err(BackendError::rejected(
                BackendErrorKind::WorkflowViolation,
                format!("ticket is {} and cannot move to {target}", current.status),
            )
            .into());
        }

        let figures = ClosureFigures::compute(
            &request.parts,
            request.labor_cost,
            current.started_at.or(request.ticket.started_at),
            Utc::now(),
        );

        self.backend
            .update_ticket(&TicketUpdate {
                ticket_id,
                status: target,
                expected_status: Some(current.status),
                form_data: merge_form_data(&current.form_data, &answers),
                closed_at: figures.closed_at,
                repair_cost: figures.repair_cost,
                maintenance_cost: figures.maintenance_cost,
                repair_duration: figures.repair_duration,
            })
            .await?;

        Ok(target)
    }

    async fn enqueue(&self, request: ClosureRequest) -> Result<ClosureOutcome, ClosureError> {
        let ticket_id = request.ticket.id;
        let mut answers = request.answers;
        for (key, file) in request.photos {
            let file = images::compress_async(file).await;
            answers.insert(key, Value::String(images::to_base64(&file)));
        }

        let figures = ClosureFigures::compute(
            &request.parts,
            request.labor_cost,
            request.ticket.started_at,
            Utc::now(),
        );

        let payload = ClosurePayload {
            selected_parts: request.parts,
            form_answers: answers,
            closed_at: figures.closed_at,
            repair_cost: figures.repair_cost,
            repair_duration: figures.repair_duration,
            technician_id: Some(request.submitted_by),
            labor_cost: request.labor_cost,
            expense: request.expense,
        };

        match self.outbox.put(ticket_id, payload).await {
            Ok(Some(id)) => {
                tracing::info!(%ticket_id, outbox_id = %id, "closure queued offline");
                self.notifier.notify(Notice::ClosureQueued { ticket_id });
                Ok(ClosureOutcome::Queued { id })
            }
            Ok(None) => {
                tracing::error!(%ticket_id, "outbox quota exceeded, closure not saved");
                self.notifier.notify(Notice::StorageQuotaExceeded);
                Ok(ClosureOutcome::NotQueued)
            }
            Err(err) => {
                tracing::error!(%ticket_id, "outbox write failed: {err}");
                Err(err.into())
            }
        }
    }

    fn report_failure(&self, err: &ClosureError) {
        let notice = match err {
            ClosureError::Backend(BackendError::Rejected { kind, message, .. }) => {
                Notice::for_kind(*kind, message.clone())
            }
            ClosureError::Backend(backend) => {
                if matches!(backend, BackendError::Offline) {
                    self.connectivity.set_offline();
                }
                Notice::Failed {
                    message: backend.user_message(),
                }
            }
            ClosureError::Image(image) => Notice::Failed {
                message: image.user_message(),
            },
            _ => return,
        };
        self.notifier.notify(notice);
    }
}

impl std::fmt::Debug for ClosureOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureOrchestrator")
            .field("connectivity", &self.connectivity.state())
            .field("geofence_radius", &self.geofence_radius)
            .finish_non_exhaustive()
    }
}

/// Local gates, checked before any side effect.
fn validate(request: &ClosureRequest, offline: bool) -> Result<(), ClosureError> {
    for key in &request.required_answers {
        let answered = request.photos.contains_key(key)
            || request.answers.get(key).is_some_and(|v| !is_blank(v));
        if !answered {
            return Err(ClosureError::MissingAnswer(key.clone()));
        }
    }

    if !request.parts.is_empty() {
        request.ticket.ensure_asset_linked()?;
    }

    // Replayed closures always end in `closed`.
    let target = if offline {
        TicketStatus::Closed
    } else {
        TicketStatus::closure_target(request.role)
    };
    request.ticket.status.transition_to(target)?;
    Ok(())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::geofence::EARTH_RADIUS_M;
    use crate::outbox::InMemoryOutbox;
    use crate::testing::{Call, FakeBackend, FixedPosition, Op, RecordingNotifier};
    use chrono::Duration as ChronoDuration;
    use fieldops_core::{AssetId, PartId, TicketId};
    use serde_json::json;

    struct Harness {
        backend: Arc<FakeBackend>,
        outbox: Arc<InMemoryOutbox>,
        notifier: Arc<RecordingNotifier>,
        connectivity: ConnectivityMonitor,
        orchestrator: ClosureOrchestrator,
    }

    fn harness(ticket: Ticket, outbox: InMemoryOutbox) -> Harness {
        let backend = Arc::new(FakeBackend::new().with_ticket(ticket));
        let outbox = Arc::new(outbox);
        let notifier = Arc::new(RecordingNotifier::new());
        let connectivity = ConnectivityMonitor::online();
        let orchestrator = ClosureOrchestrator::new(
            backend.clone(),
            outbox.clone(),
            ImageUploader::new(backend.clone()),
            connectivity.clone(),
            notifier.clone(),
        );
        Harness {
            backend,
            outbox,
            notifier,
            connectivity,
            orchestrator,
        }
    }

    fn in_progress_ticket() -> Ticket {
        Ticket::new(TicketId::new())
            .with_status(TicketStatus::InProgress)
            .with_asset(AssetId::new())
            .with_started_at(Utc::now() - ChronoDuration::minutes(90))
    }

    fn request(ticket: &Ticket, role: Role) -> ClosureRequest {
        let mut req = ClosureRequest::new(ticket.clone(), UserId::new(), role);
        req.parts = vec![
            SelectedPart::new(PartId::new(), 2, 50.0).unwrap(),
            SelectedPart::new(PartId::new(), 3, 20.0).unwrap(),
        ];
        req.labor_cost = 40.0;
        req.answers.insert("notes".into(), json!("replaced filter"));
        req
    }

    #[tokio::test]
    async fn technician_closure_commits_to_pending_approval() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());

        let outcome = h
            .orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ClosureOutcome::Committed {
                status: TicketStatus::PendingApproval
            }
        );
        let stored = h.backend.ticket(ticket.id).unwrap();
        assert_eq!(stored.status, TicketStatus::PendingApproval);
        assert_eq!(stored.repair_cost, Some(160.0));
        assert_eq!(stored.maintenance_cost, Some(200.0));
        assert!(stored.repair_duration.is_some_and(|m| m >= 90));
        assert_eq!(stored.form_data["notes"], json!("replaced filter"));
        assert_eq!(h.backend.calls_of(Op::ConsumePart).len(), 2);
        assert_eq!(
            h.notifier.notices(),
            vec![Notice::ClosureCommitted { ticket_id: ticket.id }]
        );
    }

    #[tokio::test]
    async fn manager_closes_directly_and_steps_run_in_order() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let mut req = request(&ticket, Role::Manager);
        req.expense = Some(ExpenseEntry::new(12.5, "parking"));

        h.orchestrator.submit(req).await.unwrap();

        let ops: Vec<Op> = h.backend.calls().iter().map(Call::op).collect();
        assert_eq!(
            ops,
            vec![
                Op::ConsumePart,
                Op::ConsumePart,
                Op::InsertExpense,
                Op::FetchTicket,
                Op::UpdateTicket
            ]
        );
        assert_eq!(h.backend.ticket(ticket.id).unwrap().status, TicketStatus::Closed);
        assert_eq!(h.backend.expenses()[0].amount, 12.5);
    }

    #[tokio::test]
    async fn fresh_answers_win_over_stored_ones() {
        let mut ticket = in_progress_ticket();
        ticket.form_data.insert("notes".into(), json!("old"));
        ticket.form_data.insert("meter".into(), json!(1200));
        let h = harness(ticket.clone(), InMemoryOutbox::new());

        h.orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap();

        let stored = h.backend.ticket(ticket.id).unwrap();
        assert_eq!(stored.form_data["notes"], json!("replaced filter"));
        assert_eq!(stored.form_data["meter"], json!(1200));
    }

    #[tokio::test]
    async fn parts_without_asset_make_no_remote_calls() {
        let ticket = Ticket::new(TicketId::new()).with_status(TicketStatus::InProgress);
        let h = harness(ticket.clone(), InMemoryOutbox::new());

        let err = h
            .orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap_err();

        assert!(matches!(err, ClosureError::Validation(_)));
        assert!(h.backend.calls().is_empty());
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn missing_required_answer_is_rejected_locally() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let mut req = request(&ticket, Role::Technician);
        req.required_answers = vec!["signature".into()];
        req.answers.insert("signature".into(), json!("  "));

        let err = h.orchestrator.submit(req).await.unwrap_err();

        assert!(matches!(err, ClosureError::MissingAnswer(ref k) if k == "signature"));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn closed_ticket_cannot_be_closed_again() {
        let ticket = in_progress_ticket().with_status(TicketStatus::Closed);
        let h = harness(ticket.clone(), InMemoryOutbox::new());

        let err = h
            .orchestrator
            .submit(request(&ticket, Role::Manager))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClosureError::Validation(DomainError::InvalidTransition { .. })
        ));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn closure_250_m_from_site_is_blocked() {
        let ticket = in_progress_ticket();
        let site = GeoPoint::new(41.0082, 28.9784);
        let meters_per_degree = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        let here = GeoPoint::new(site.latitude + 250.0 / meters_per_degree, site.longitude);

        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let orchestrator = h
            .orchestrator
            .clone()
            .with_locator(Geolocator::new(Arc::new(FixedPosition::at(here))));
        let mut req = request(&ticket, Role::Technician);
        req.site = Some(site);

        let err = orchestrator.submit(req).await.unwrap_err();

        match err {
            ClosureError::OutsideGeofence {
                distance_meters,
                radius_meters,
            } => {
                assert_eq!(distance_meters.round(), 250.0);
                assert_eq!(radius_meters, 200.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn configured_radius_drives_the_geofence() {
        let ticket = in_progress_ticket();
        let site = GeoPoint::new(41.0082, 28.9784);
        let meters_per_degree = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        let here = GeoPoint::new(site.latitude + 250.0 / meters_per_degree, site.longitude);
        let positions = Arc::new(FixedPosition::at(here));

        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let mut req = request(&ticket, Role::Technician);
        req.site = Some(site);

        let wide = ClientConfig {
            geofence_radius_m: 300.0,
            ..ClientConfig::default()
        };
        let outcome = h
            .orchestrator
            .clone()
            .with_site_checks(&wide, positions.clone())
            .submit(req.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, ClosureOutcome::Committed { .. }));

        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let narrow = ClientConfig {
            geofence_radius_m: 100.0,
            ..ClientConfig::default()
        };
        let err = h
            .orchestrator
            .clone()
            .with_site_checks(&narrow, positions)
            .submit(req)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClosureError::OutsideGeofence { radius_meters, .. } if radius_meters == 100.0
        ));
    }

    #[tokio::test]
    async fn offline_submission_is_queued_with_zero_retries() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        h.connectivity.set_offline();
        let mut req = request(&ticket, Role::Technician);
        req.photos.insert(
            "photo_after".into(),
            ImageFile::new("after.jpg", "image/jpeg", vec![7; 32]),
        );

        let outcome = h.orchestrator.submit(req).await.unwrap();

        let ClosureOutcome::Queued { id } = outcome else {
            panic!("expected queued, got {outcome:?}");
        };
        let queued = h.outbox.get_all().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].retry_count, 0);
        assert_eq!(queued[0].payload.repair_cost, 160.0);
        assert_eq!(queued[0].payload.labor_cost, 40.0);
        assert!(images::is_inline_attachment(&queued[0].payload.form_answers["photo_after"]));
        assert!(h.backend.calls().is_empty());
        assert_eq!(
            h.notifier.notices(),
            vec![Notice::ClosureQueued { ticket_id: ticket.id }]
        );
    }

    #[tokio::test]
    async fn full_outbox_reports_quota_without_error() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::with_capacity(0));
        h.connectivity.set_offline();

        let outcome = h
            .orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap();

        assert_eq!(outcome, ClosureOutcome::NotQueued);
        assert_eq!(h.notifier.notices(), vec![Notice::StorageQuotaExceeded]);
    }

    #[tokio::test]
    async fn busy_part_aborts_before_ticket_update() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        h.backend.fail_next(
            Op::ConsumePart,
            BackendError::rejected(BackendErrorKind::ResourceBusy, "row locked"),
        );

        let err = h
            .orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap_err();

        assert!(err.user_message().contains("being updated"));
        assert!(h.backend.calls_of(Op::UpdateTicket).is_empty());
        assert_eq!(h.backend.ticket(ticket.id).unwrap().status, TicketStatus::InProgress);
        assert_eq!(h.notifier.notices(), vec![Notice::ResourceBusy]);
    }

    #[tokio::test]
    async fn status_change_after_read_is_a_workflow_violation() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        // Someone else moved the ticket on since the form was opened.
        h.backend
            .insert_ticket(ticket.clone().with_status(TicketStatus::Cancelled));

        let err = h
            .orchestrator
            .submit(request(&ticket, Role::Technician))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClosureError::Backend(BackendError::Rejected {
                kind: BackendErrorKind::WorkflowViolation,
                ..
            })
        ));
        assert_eq!(h.notifier.notices(), vec![Notice::WorkflowViolation]);
    }

    #[tokio::test]
    async fn failed_photo_upload_consumes_nothing() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        h.backend.fail_next(Op::Upload, BackendError::Offline);
        let mut req = request(&ticket, Role::Technician);
        req.photos.insert(
            "photo_after".into(),
            ImageFile::new("after.jpg", "image/jpeg", vec![1, 2, 3]),
        );

        let err = h.orchestrator.submit(req).await.unwrap_err();

        assert!(matches!(err, ClosureError::Image(_)));
        assert!(h.backend.calls_of(Op::ConsumePart).is_empty());
    }

    #[tokio::test]
    async fn uploaded_photo_url_lands_in_form_data() {
        let ticket = in_progress_ticket();
        let h = harness(ticket.clone(), InMemoryOutbox::new());
        let mut req = request(&ticket, Role::Technician);
        req.photos.insert(
            "photo_after".into(),
            ImageFile::new("after.jpg", "image/jpeg", vec![1, 2, 3]),
        );

        h.orchestrator.submit(req).await.unwrap();

        let stored = h.backend.ticket(ticket.id).unwrap();
        let url = stored.form_data["photo_after"].as_str().unwrap();
        assert!(url.starts_with("https://storage.test/"));
    }

    #[test]
    fn error_classes_have_distinct_messages() {
        let errors = [
            ClosureError::MissingAnswer("notes".into()),
            ClosureError::OutsideGeofence {
                distance_meters: 250.0,
                radius_meters: 200.0,
            },
            ClosureError::Location(LocationError::Timeout),
            ClosureError::Image(ImageError::Timeout),
            ClosureError::Backend(BackendError::rejected(
                BackendErrorKind::Duplicate,
                "dup",
            )),
            ClosureError::Outbox(OutboxError::Storage("disk".into())),
        ];
        let messages: std::collections::HashSet<String> =
            errors.iter().map(ClosureError::user_message).collect();
        assert_eq!(messages.len(), errors.len());
        assert!(errors[1].user_message().contains("250 m"));
    }
}
