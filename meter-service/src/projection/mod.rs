//! Read-only views derived from meter state for reporting.

use std::collections::BTreeMap;

use meter_client::domain::{MonthKey, Reading};
use serde::Serialize;

use crate::store::MeterState;

/// Daily readings that fall in one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyGroup {
    pub month: MonthKey,
    pub label: String,
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingRow {
    /// Closing month for locked rows; the last locked month for the running row.
    pub month: MonthKey,
    pub closing_reading: f64,
    pub units: f64,
    pub is_projected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyUsage {
    pub family: String,
    pub color: Option<String>,
    pub meter_count: usize,
    pub current_meter: Option<String>,
    pub total_units: f64,
}

/// Group `history` by month, most recent month first. Readings keep the
/// order they have in `history`.
pub fn group_daily_by_month(history: &[Reading]) -> Vec<DailyGroup> {
    let mut groups: BTreeMap<MonthKey, Vec<Reading>> = BTreeMap::new();
    for reading in history {
        groups
            .entry(MonthKey::containing(reading.date))
            .or_default()
            .push(reading.clone());
    }

    groups
        .into_iter()
        .rev()
        .map(|(month, readings)| DailyGroup {
            label: month.display_name(),
            month,
            readings,
        })
        .collect()
}

/// Monthly usage rows, most recent first.
///
/// Each pair of adjacent locked months yields a locked row; the month after
/// the last lock is projected from `latest_reading`. No locked months, no
/// rows. Units are reported as-is, negative ones included.
pub fn project_monthly_billing(baselines: &BTreeMap<MonthKey, f64>, latest_reading: f64) -> Vec<BillingRow> {
    let Some((last_month, last_value)) = baselines.iter().next_back() else {
        return Vec::new();
    };

    let mut rows: Vec<BillingRow> = baselines
        .iter()
        .zip(baselines.iter().skip(1))
        .map(|((_, prev), (month, closing))| BillingRow {
            month: month.clone(),
            closing_reading: *closing,
            units: closing - prev,
            is_projected: false,
        })
        .collect();

    rows.push(BillingRow {
        month: last_month.clone(),
        closing_reading: latest_reading,
        units: latest_reading - last_value,
        is_projected: true,
    });

    rows.reverse();
    rows
}

/// Open-cycle usage summed per family, in family-list order. Families with
/// no meters are left out.
pub fn family_usage(state: &MeterState) -> Vec<FamilyUsage> {
    state
        .families
        .iter()
        .filter_map(|family| {
            let meters: Vec<_> = state.meters_in(family).collect();
            if meters.is_empty() {
                return None;
            }

            Some(FamilyUsage {
                family: family.clone(),
                color: state.family_themes.get(family).cloned(),
                meter_count: meters.len(),
                current_meter: meters.iter().find(|m| m.is_current).map(|m| m.id.clone()),
                total_units: meters.iter().map(|m| m.units_used()).sum(),
            })
        })
        .collect()
}
