use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    seed::{seed_families, seed_family_themes},
    Meter,
};

/// The single shared record every client reads and replaces as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterDocument {
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default = "seed_families")]
    pub families: Vec<String>,
    /// Family name to color label.
    #[serde(default = "seed_family_themes")]
    pub family_themes: BTreeMap<String, String>,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

impl MeterDocument {
    pub fn meter(&self, id: &str) -> Option<&Meter> {
        self.meters.iter().find(|m| m.id == id)
    }
}
