use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::MonthKey;

/// A single daily reading. `value` is the absolute register value, not a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub value: f64,
}

impl Reading {
    /// Time-derived id (unix milliseconds), matching the ids already stored
    /// in shared documents.
    pub fn id_at(ts: OffsetDateTime) -> String {
        (ts.unix_timestamp_nanos() / 1_000_000).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub meter_number: String,
    pub family: String,
    #[serde(default)]
    pub is_current: bool,
    /// Baseline of the open billing cycle.
    #[serde(default)]
    pub last_month_reading: f64,
    #[serde(default)]
    pub latest_reading: f64,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Daily readings, newest first.
    #[serde(default)]
    pub history: Vec<Reading>,
    /// Locked closing readings per month.
    #[serde(default)]
    pub monthly_baselines: BTreeMap<MonthKey, f64>,
}

impl Meter {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        meter_number: impl Into<String>,
        family: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            meter_number: meter_number.into(),
            family: family.into(),
            is_current: false,
            last_month_reading: 0.0,
            latest_reading: 0.0,
            last_updated: now,
            history: Vec::new(),
            monthly_baselines: BTreeMap::new(),
        }
    }

    /// Units consumed in the open cycle. Negative after a correction.
    pub fn units_used(&self) -> f64 {
        self.latest_reading - self.last_month_reading
    }

    pub fn is_locked(&self, month: &MonthKey) -> bool {
        self.monthly_baselines.contains_key(month)
    }

    pub fn latest_locked_month(&self) -> Option<&MonthKey> {
        self.monthly_baselines.keys().next_back()
    }
}
