//! Default dataset written the first time a store has no shared document.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use super::{Meter, MeterDocument};

pub const SEED_FAMILIES: [(&str, &str); 2] = [("A", "indigo"), ("B", "emerald")];

/// Four meters per seed family; the first of each family starts as current.
const SEED_METERS: [(&str, &str, &str, &str); 8] = [
    ("m1", "Meter 1", "REF-001", "A"),
    ("m2", "Meter 2", "REF-002", "A"),
    ("m3", "Meter 3", "REF-003", "A"),
    ("m4", "Meter 4", "REF-004", "A"),
    ("m5", "Meter 5", "REF-005", "B"),
    ("m6", "Meter 6", "REF-006", "B"),
    ("m7", "Meter 7", "REF-007", "B"),
    ("m8", "Meter 8", "REF-008", "B"),
];

pub fn seed_families() -> Vec<String> {
    SEED_FAMILIES.iter().map(|(name, _)| name.to_string()).collect()
}

pub fn seed_family_themes() -> BTreeMap<String, String> {
    SEED_FAMILIES
        .iter()
        .map(|(name, color)| (name.to_string(), color.to_string()))
        .collect()
}

pub fn seed_meters(now: OffsetDateTime) -> Vec<Meter> {
    SEED_METERS
        .iter()
        .map(|(id, name, number, family)| {
            let mut meter = Meter::new(*id, *name, *number, *family, now);
            meter.is_current = matches!(*id, "m1" | "m5");
            meter
        })
        .collect()
}

pub fn seed_document(now: OffsetDateTime) -> MeterDocument {
    MeterDocument {
        meters: seed_meters(now),
        families: seed_families(),
        family_themes: seed_family_themes(),
        last_modified: now,
    }
}
