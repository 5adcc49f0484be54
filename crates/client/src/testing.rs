//! In-memory collaborators for tests and local development.
//!
//! [`FakeBackend`] keeps tickets and assets in memory, records every call and
//! can be scripted to fail; [`RecordingNotifier`] keeps every notice;
//! [`FixedPosition`] answers location requests with a canned fix.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fieldops_core::{AssetId, OutboxId, PartId, TicketId};
use fieldops_tickets::{Asset, Compatibility, Ticket};

use crate::backend::{
    Backend, BackendError, BackendErrorKind, ConsumePart, ConsumePartsBatch, NewExpense,
    ObjectStorage, TicketUpdate,
};
use crate::geofence::{GeoPoint, LocationError, Position, PositionOptions, PositionProvider};
use crate::notify::{Notice, Notifier};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend operations, for scripting failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    ConsumePart,
    ConsumePartsBatch,
    FetchTicket,
    UpdateTicket,
    InsertExpense,
    FetchAsset,
    CheckCompatibility,
    Upload,
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ConsumePart(ConsumePart),
    ConsumePartsBatch(ConsumePartsBatch),
    FetchTicket(TicketId),
    UpdateTicket(TicketUpdate),
    InsertExpense(NewExpense),
    FetchAsset(AssetId),
    CheckCompatibility(AssetId, PartId),
    Upload(String),
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::ConsumePart(_) => Op::ConsumePart,
            Call::ConsumePartsBatch(_) => Op::ConsumePartsBatch,
            Call::FetchTicket(_) => Op::FetchTicket,
            Call::UpdateTicket(_) => Op::UpdateTicket,
            Call::InsertExpense(_) => Op::InsertExpense,
            Call::FetchAsset(_) => Op::FetchAsset,
            Call::CheckCompatibility(..) => Op::CheckCompatibility,
            Call::Upload(_) => Op::Upload,
        }
    }
}

#[derive(Default)]
struct FakeState {
    tickets: HashMap<TicketId, Ticket>,
    assets: HashMap<AssetId, Asset>,
    compatibility: HashMap<PartId, Compatibility>,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<BackendError>>,
    always_fail: HashMap<Op, BackendError>,
    applied_batches: HashSet<OutboxId>,
    expenses: Vec<NewExpense>,
    uploads: Vec<String>,
    upload_delay: Option<Duration>,
    unhealthy: bool,
}

/// In-memory backend and object storage.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ticket(self, ticket: Ticket) -> Self {
        self.insert_ticket(ticket);
        self
    }

    pub fn with_asset(self, asset: Asset) -> Self {
        lock(&self.state).assets.insert(asset.id, asset);
        self
    }

    pub fn insert_ticket(&self, ticket: Ticket) {
        lock(&self.state).tickets.insert(ticket.id, ticket);
    }

    pub fn ticket(&self, id: TicketId) -> Option<Ticket> {
        lock(&self.state).tickets.get(&id).cloned()
    }

    pub fn set_compatibility(&self, part_id: PartId, result: Compatibility) {
        lock(&self.state).compatibility.insert(part_id, result);
    }

    /// Fail the next call of `op` with `err`; queued failures are used in order.
    pub fn fail_next(&self, op: Op, err: BackendError) {
        lock(&self.state).failures.entry(op).or_default().push_back(err);
    }

    /// Fail every call of `op` until [`FakeBackend::recover`].
    pub fn fail_always(&self, op: Op, err: BackendError) {
        lock(&self.state).always_fail.insert(op, err);
    }

    pub fn recover(&self, op: Op) {
        let mut state = lock(&self.state);
        state.always_fail.remove(&op);
        state.failures.remove(&op);
    }

    pub fn stall_uploads(&self, delay: Duration) {
        lock(&self.state).upload_delay = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        lock(&self.state).unhealthy = !healthy;
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .cloned()
            .collect()
    }

    pub fn uploads(&self) -> Vec<String> {
        lock(&self.state).uploads.clone()
    }

    pub fn expenses(&self) -> Vec<NewExpense> {
        lock(&self.state).expenses.clone()
    }

    /// Record the call and return the scripted failure for it, if any.
    fn enter(&self, call: Call) -> Result<(), BackendError> {
        let op = call.op();
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(err) = state.always_fail.get(&op) {
            return Err(err.clone());
        }
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn consume_part(&self, request: &ConsumePart) -> Result<(), BackendError> {
        self.enter(Call::ConsumePart(request.clone()))?;
        let state = lock(&self.state);
        match state.tickets.get(&request.ticket_id) {
            Some(ticket) if ticket.status.is_terminal() => Err(BackendError::rejected(
                BackendErrorKind::WorkflowViolation,
                "ticket status does not allow part consumption",
            )),
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("ticket {}", request.ticket_id))),
        }
    }

    async fn consume_parts_batch(&self, request: &ConsumePartsBatch) -> Result<(), BackendError> {
        self.enter(Call::ConsumePartsBatch(request.clone()))?;
        let mut state = lock(&self.state);
        if !state.applied_batches.insert(request.idempotency_key) {
            return Err(BackendError::rejected(
                BackendErrorKind::Duplicate,
                "batch already applied",
            ));
        }
        Ok(())
    }

    async fn fetch_ticket(&self, ticket_id: TicketId) -> Result<Ticket, BackendError> {
        self.enter(Call::FetchTicket(ticket_id))?;
        self.ticket(ticket_id)
            .ok_or_else(|| BackendError::NotFound(format!("ticket {ticket_id}")))
    }

    async fn update_ticket(&self, update: &TicketUpdate) -> Result<(), BackendError> {
        self.enter(Call::UpdateTicket(update.clone()))?;
        let mut state = lock(&self.state);
        let ticket = state
            .tickets
            .get_mut(&update.ticket_id)
            .ok_or_else(|| BackendError::NotFound(format!("ticket {}", update.ticket_id)))?;

        if update.expected_status.is_some_and(|s| s != ticket.status) {
            return Err(BackendError::rejected(
                BackendErrorKind::WorkflowViolation,
                "ticket status changed",
            ));
        }

        ticket.status = update.status;
        ticket.form_data = update.form_data.clone();
        ticket.closed_at = Some(update.closed_at);
        ticket.repair_cost = Some(update.repair_cost);
        ticket.maintenance_cost = Some(update.maintenance_cost);
        ticket.repair_duration = update.repair_duration;
        Ok(())
    }

    async fn insert_expense(&self, expense: &NewExpense) -> Result<(), BackendError> {
        self.enter(Call::InsertExpense(expense.clone()))?;
        let mut state = lock(&self.state);
        let seen = expense.client_ref.is_some()
            && state.expenses.iter().any(|e| e.client_ref == expense.client_ref);
        if !seen {
            state.expenses.push(expense.clone());
        }
        Ok(())
    }

    async fn fetch_asset(&self, asset_id: AssetId) -> Result<Asset, BackendError> {
        self.enter(Call::FetchAsset(asset_id))?;
        lock(&self.state)
            .assets
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("asset {asset_id}")))
    }

    async fn check_compatibility(
        &self,
        asset_id: AssetId,
        part_id: PartId,
    ) -> Result<Compatibility, BackendError> {
        self.enter(Call::CheckCompatibility(asset_id, part_id))?;
        Ok(lock(&self.state)
            .compatibility
            .get(&part_id)
            .cloned()
            .unwrap_or(Compatibility::Compatible))
    }

    async fn health(&self) -> bool {
        !lock(&self.state).unhealthy
    }
}

#[async_trait]
impl ObjectStorage for FakeBackend {
    async fn upload(
        &self,
        path: &str,
        _content_type: &str,
        _bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let delay = lock(&self.state).upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter(Call::Upload(path.to_string()))?;
        lock(&self.state).uploads.push(path.to_string());
        Ok(format!("https://storage.test/public/{path}"))
    }
}

/// Keeps every notice it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }

    pub fn count(&self, matches: impl Fn(&Notice) -> bool) -> usize {
        lock(&self.notices).iter().filter(|&n| matches(n)).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        lock(&self.notices).push(notice);
    }
}

/// Positioning service returning a canned answer.
#[derive(Debug)]
pub struct FixedPosition {
    answer: Result<Position, LocationError>,
    delay: Option<Duration>,
    last_options: Mutex<Option<PositionOptions>>,
}

impl FixedPosition {
    pub fn at(point: GeoPoint) -> Self {
        Self {
            answer: Ok(Position {
                point,
                accuracy: Some(5.0),
            }),
            delay: None,
            last_options: Mutex::new(None),
        }
    }

    pub fn delayed(point: GeoPoint, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::at(point)
        }
    }

    pub fn failing(err: LocationError) -> Self {
        Self {
            answer: Err(err),
            delay: None,
            last_options: Mutex::new(None),
        }
    }

    pub fn last_options(&self) -> Option<PositionOptions> {
        *lock(&self.last_options)
    }
}

#[async_trait]
impl PositionProvider for FixedPosition {
    async fn current_position(&self, options: &PositionOptions) -> Result<Position, LocationError> {
        *lock(&self.last_options) = Some(*options);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer.clone()
    }
}
