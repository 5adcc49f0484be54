//! Closure math: costs, duration and form-data merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fieldops_core::{DomainError, DomainResult, PartId};

/// Opaque answers of a ticket's closure form, keyed by field name.
pub type FormData = Map<String, Value>;

/// A spare part picked on the closure form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedPart {
    pub part_id: PartId,
    pub used_quantity: u32,
    pub unit_price: f64,
}

impl SelectedPart {
    pub fn new(part_id: PartId, used_quantity: u32, unit_price: f64) -> DomainResult<Self> {
        if used_quantity == 0 {
            return Err(DomainError::validation("used quantity must be at least 1"));
        }
        if !unit_price.is_finite() || unit_price < 0.0 {
            return Err(DomainError::validation("unit price must be a non-negative amount"));
        }
        Ok(Self {
            part_id,
            used_quantity,
            unit_price,
        })
    }

    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.used_quantity)
    }
}

/// `Σ(unit_price × used_quantity)` over the selected parts.
pub fn repair_cost(parts: &[SelectedPart]) -> f64 {
    parts.iter().map(SelectedPart::line_total).sum()
}

pub fn maintenance_cost(repair_cost: f64, labor_cost: f64) -> f64 {
    repair_cost + labor_cost
}

/// Whole minutes between start and close.
///
/// `None` when the ticket was never started or the close is not after the start.
pub fn repair_duration_minutes(
    started_at: Option<DateTime<Utc>>,
    closed_at: DateTime<Utc>,
) -> Option<i64> {
    let started_at = started_at?;
    if closed_at <= started_at {
        return None;
    }
    Some((closed_at - started_at).num_minutes())
}

/// Merge fresh answers over the stored ones (last writer wins per key).
pub fn merge_form_data(current: &FormData, fresh: &FormData) -> FormData {
    let mut merged = current.clone();
    for (key, value) in fresh {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Figures written to the ticket when it is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureFigures {
    pub closed_at: DateTime<Utc>,
    pub repair_cost: f64,
    pub maintenance_cost: f64,
    pub repair_duration: Option<i64>,
}

impl ClosureFigures {
    pub fn compute(
        parts: &[SelectedPart],
        labor_cost: f64,
        started_at: Option<DateTime<Utc>>,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let repair_cost = repair_cost(parts);
        Self {
            closed_at,
            repair_cost,
            maintenance_cost: maintenance_cost(repair_cost, labor_cost),
            repair_duration: repair_duration_minutes(started_at, closed_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 8, 0, 0).unwrap()
    }

    fn part(qty: u32, price: f64) -> SelectedPart {
        SelectedPart::new(PartId::new(), qty, price).unwrap()
    }

    #[test]
    fn two_parts_cost_example() {
        let parts = vec![part(2, 50.0), part(3, 20.0)];
        let figures = ClosureFigures::compute(&parts, 75.0, None, t0());
        assert_eq!(figures.repair_cost, 160.0);
        assert_eq!(figures.maintenance_cost, 235.0);
        assert_eq!(figures.repair_duration, None);
    }

    #[test]
    fn no_parts_costs_only_labor() {
        let figures = ClosureFigures::compute(&[], 40.0, None, t0());
        assert_eq!(figures.repair_cost, 0.0);
        assert_eq!(figures.maintenance_cost, 40.0);
    }

    #[test]
    fn zero_quantity_is_rejected() {
        assert!(SelectedPart::new(PartId::new(), 0, 10.0).is_err());
        assert!(SelectedPart::new(PartId::new(), 1, -1.0).is_err());
        assert!(SelectedPart::new(PartId::new(), 1, f64::NAN).is_err());
    }

    #[test]
    fn duration_is_null_without_start_or_when_not_positive() {
        assert_eq!(repair_duration_minutes(None, t0()), None);
        assert_eq!(repair_duration_minutes(Some(t0()), t0()), None);
        assert_eq!(repair_duration_minutes(Some(t0()), t0() - Duration::minutes(5)), None);
    }

    #[test]
    fn duration_counts_whole_minutes() {
        let closed = t0() + Duration::minutes(90) + Duration::seconds(59);
        assert_eq!(repair_duration_minutes(Some(t0()), closed), Some(90));
    }

    #[test]
    fn fresh_answers_win_and_untouched_keys_survive() {
        let current = json!({"notes": "old", "meter": 120}).as_object().cloned().unwrap();
        let fresh = json!({"notes": "replaced belt", "photo": "https://x/y.jpg"})
            .as_object()
            .cloned()
            .unwrap();

        let merged = merge_form_data(&current, &fresh);
        assert_eq!(merged["notes"], json!("replaced belt"));
        assert_eq!(merged["meter"], json!(120));
        assert_eq!(merged["photo"], json!("https://x/y.jpg"));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: closing after the start yields exactly the elapsed whole minutes.
        #[test]
        fn duration_matches_elapsed_minutes(offset_secs in 1i64..10_000_000i64) {
            let closed = t0() + Duration::seconds(offset_secs);
            prop_assert_eq!(repair_duration_minutes(Some(t0()), closed), Some(offset_secs / 60));
        }

        /// Property: closing at or before the start never yields a duration.
        #[test]
        fn duration_absent_when_not_after_start(offset_secs in 0i64..10_000_000i64) {
            let closed = t0() - Duration::seconds(offset_secs);
            prop_assert_eq!(repair_duration_minutes(Some(t0()), closed), None);
        }

        /// Property: maintenance cost is always repair cost plus labor.
        #[test]
        fn maintenance_is_repair_plus_labor(
            lines in prop::collection::vec((1u32..50u32, 0u32..10_000u32), 0..8),
            labor in 0u32..100_000u32,
        ) {
            let parts: Vec<SelectedPart> = lines
                .iter()
                .map(|(qty, price)| part(*qty, f64::from(*price)))
                .collect();
            let expected: u64 = lines.iter().map(|(q, p)| u64::from(*q) * u64::from(*p)).sum();

            let figures = ClosureFigures::compute(&parts, f64::from(labor), None, t0());
            prop_assert_eq!(figures.repair_cost, expected as f64);
            prop_assert_eq!(figures.maintenance_cost, expected as f64 + f64::from(labor));
        }
    }
}
