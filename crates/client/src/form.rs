//! Closure form state: part selection with compatibility checks and the
//! debounced cost advisory.

use std::collections::BTreeMap;
use std::time::Duration;

use fieldops_core::{Role, UserId};
use fieldops_tickets::{Asset, Compatibility, FormData, SelectedPart, Ticket};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::closure::{ClosureError, ClosureRequest};
use crate::geofence::GeoPoint;
use crate::images::ImageFile;
use crate::types::ExpenseEntry;

/// Quiet period before the cost advisory is re-evaluated.
pub const COST_ADVISORY_DEBOUNCE: Duration = Duration::from_millis(800);

/// Share of the asset purchase value above which a repair is flagged.
pub const COST_ADVISORY_RATIO: f64 = 0.5;

/// Non-blocking hint that a repair is approaching the asset's value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAdvisory {
    pub total_cost: f64,
    pub purchase_value: f64,
    /// `total_cost / purchase_value`.
    pub ratio: f64,
}

impl CostAdvisory {
    pub fn message(&self) -> String {
        format!(
            "This repair ({:.2}) is {:.0}% of the asset's purchase value ({:.2}). Consider replacing the asset.",
            self.total_cost,
            self.ratio * 100.0,
            self.purchase_value
        )
    }
}

/// Advisory for a repair of `total_cost` on an asset worth `purchase_value`.
pub fn evaluate(purchase_value: Option<f64>, total_cost: f64) -> Option<CostAdvisory> {
    let purchase_value = purchase_value.filter(|v| *v > 0.0)?;
    if total_cost <= purchase_value * COST_ADVISORY_RATIO {
        return None;
    }
    Some(CostAdvisory {
        total_cost,
        purchase_value,
        ratio: total_cost / purchase_value,
    })
}

/// Re-evaluates the advisory once cost edits have settled.
///
/// Each update restarts the quiet period; the background task is aborted when
/// the advisor is dropped.
#[derive(Debug)]
pub struct CostAdvisor {
    input: watch::Sender<f64>,
    output: watch::Receiver<Option<CostAdvisory>>,
    task: JoinHandle<()>,
}

impl CostAdvisor {
    /// Must be called inside a tokio runtime.
    pub fn new(purchase_value: Option<f64>) -> Self {
        Self::with_debounce(purchase_value, COST_ADVISORY_DEBOUNCE)
    }

    pub fn with_debounce(purchase_value: Option<f64>, debounce: Duration) -> Self {
        let (input, mut rx) = watch::channel(0.0_f64);
        let (tx, output) = watch::channel(None);

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }

                let total = *rx.borrow_and_update();
                let advisory = evaluate(purchase_value, total);
                tracing::debug!(total, flagged = advisory.is_some(), "cost advisory evaluated");
                tx.send_if_modified(|current| {
                    if *current == advisory {
                        false
                    } else {
                        *current = advisory;
                        true
                    }
                });
            }
        });

        Self {
            input,
            output,
            task,
        }
    }

    pub fn update(&self, total_cost: f64) {
        self.input.send_replace(total_cost);
    }

    pub fn advisory(&self) -> Option<CostAdvisory> {
        self.output.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CostAdvisory>> {
        self.output.clone()
    }
}

impl Drop for CostAdvisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of adding a part to the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartAdmission {
    Added,
    /// Added; the message must be shown to the user.
    AddedWithWarning(String),
}

/// The closure form for one ticket.
#[derive(Debug)]
pub struct ClosureForm {
    ticket: Ticket,
    asset: Option<Asset>,
    parts: Vec<SelectedPart>,
    answers: FormData,
    photos: BTreeMap<String, ImageFile>,
    labor_cost: f64,
    expense: Option<ExpenseEntry>,
    warnings: Vec<String>,
    advisor: CostAdvisor,
}

impl ClosureForm {
    /// Open the form, loading the linked asset when there is one.
    ///
    /// An asset that cannot be loaded only disables the cost advisory.
    pub async fn open(backend: &dyn Backend, ticket: Ticket) -> Self {
        let asset = match ticket.asset_id {
            Some(asset_id) => match backend.fetch_asset(asset_id).await {
                Ok(asset) => Some(asset),
                Err(err) => {
                    tracing::warn!(ticket_id = %ticket.id, %asset_id, "asset lookup failed: {err}");
                    None
                }
            },
            None => None,
        };
        Self::with_asset(ticket, asset)
    }

    pub fn with_asset(ticket: Ticket, asset: Option<Asset>) -> Self {
        let purchase_value = asset.as_ref().and_then(|a| a.purchase_value);
        Self {
            answers: ticket.form_data.clone(),
            ticket,
            asset,
            parts: Vec::new(),
            photos: BTreeMap::new(),
            labor_cost: 0.0,
            expense: None,
            warnings: Vec::new(),
            advisor: CostAdvisor::new(purchase_value),
        }
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub fn parts(&self) -> &[SelectedPart] {
        &self.parts
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Add a part after checking it against the ticket's asset.
    ///
    /// Parts flagged as errors are refused. A failed lookup lets the part
    /// through; the backend still validates consumption.
    pub async fn add_part(
        &mut self,
        backend: &dyn Backend,
        part: SelectedPart,
    ) -> Result<PartAdmission, ClosureError> {
        let asset_id = self.ticket.ensure_asset_linked()?;

        let admission = match backend.check_compatibility(asset_id, part.part_id).await {
            Ok(Compatibility::Compatible) => PartAdmission::Added,
            Ok(Compatibility::Warning(message)) => {
                self.warnings.push(message.clone());
                PartAdmission::AddedWithWarning(message)
            }
            Ok(Compatibility::Error(message)) => {
                return Err(ClosureError::IncompatiblePart {
                    part_id: part.part_id,
                    message,
                });
            }
            Err(err) => {
                tracing::warn!(%asset_id, part_id = %part.part_id, "compatibility check failed, allowing part: {err}");
                PartAdmission::Added
            }
        };

        self.parts.push(part);
        self.refresh_cost();
        Ok(admission)
    }

    pub fn remove_part(&mut self, index: usize) -> Option<SelectedPart> {
        if index >= self.parts.len() {
            return None;
        }
        let part = self.parts.remove(index);
        self.refresh_cost();
        Some(part)
    }

    pub fn set_labor_cost(&mut self, labor_cost: f64) {
        self.labor_cost = labor_cost;
        self.refresh_cost();
    }

    pub fn set_expense(&mut self, expense: Option<ExpenseEntry>) {
        self.expense = expense;
    }

    pub fn answer(&mut self, key: impl Into<String>, value: Value) {
        self.answers.insert(key.into(), value);
    }

    pub fn attach_photo(&mut self, key: impl Into<String>, file: ImageFile) {
        self.photos.insert(key.into(), file);
    }

    pub fn parts_cost(&self) -> f64 {
        fieldops_tickets::repair_cost(&self.parts)
    }

    pub fn total_cost(&self) -> f64 {
        fieldops_tickets::maintenance_cost(self.parts_cost(), self.labor_cost)
    }

    pub fn cost_advisory(&self) -> Option<CostAdvisory> {
        self.advisor.advisory()
    }

    pub fn subscribe_cost_advisory(&self) -> watch::Receiver<Option<CostAdvisory>> {
        self.advisor.subscribe()
    }

    fn refresh_cost(&self) {
        if self.asset.is_some() {
            self.advisor.update(self.total_cost());
        }
    }

    pub fn into_request(
        self,
        submitted_by: UserId,
        role: Role,
        required_answers: Vec<String>,
        site: Option<GeoPoint>,
    ) -> ClosureRequest {
        ClosureRequest {
            ticket: self.ticket,
            submitted_by,
            role,
            parts: self.parts,
            answers: self.answers,
            required_answers,
            photos: self.photos,
            labor_cost: self.labor_cost,
            expense: self.expense,
            site,
        }
    }
}
