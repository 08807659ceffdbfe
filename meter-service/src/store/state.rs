use std::collections::BTreeMap;

use meter_client::domain::{Meter, MeterDocument, MonthKey, Reading};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::validation::can_delete_family;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown meter '{0}'")]
    UnknownMeter(String),
    #[error("meter '{0}' already exists")]
    DuplicateMeter(String),
    #[error("unknown family '{0}'")]
    UnknownFamily(String),
    #[error("family '{0}' already exists")]
    DuplicateFamily(String),
    #[error("family '{family}' still has {meters} meter(s) attached")]
    FamilyInUse { family: String, meters: usize },
    #[error("meter data has not been loaded yet")]
    NotLoaded,
}

/// Caller-supplied fields of a new meter.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeter {
    pub id: String,
    pub name: String,
    pub meter_number: String,
    pub family: String,
}

impl NewMeter {
    pub fn generated_id(now: OffsetDateTime) -> String {
        format!("m-{}", Reading::id_at(now))
    }
}

/// Descriptive fields a meter edit may change. Readings, baselines and the
/// current flag have their own operations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterPatch {
    pub name: Option<String>,
    pub meter_number: Option<String>,
    pub family: Option<String>,
}

/// Full in-memory state. Every method either applies its whole change or
/// returns an error having changed nothing.
///
/// Mutations return `Ok(false)` when the state is already as requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterState {
    pub meters: Vec<Meter>,
    pub families: Vec<String>,
    pub family_themes: BTreeMap<String, String>,
}

impl MeterState {
    pub fn from_document(doc: MeterDocument) -> Self {
        Self {
            meters: doc.meters,
            families: doc.families,
            family_themes: doc.family_themes,
        }
    }

    pub fn to_document(&self, now: OffsetDateTime) -> MeterDocument {
        MeterDocument {
            meters: self.meters.clone(),
            families: self.families.clone(),
            family_themes: self.family_themes.clone(),
            last_modified: now,
        }
    }

    pub fn meter(&self, id: &str) -> Option<&Meter> {
        self.meters.iter().find(|m| m.id == id)
    }

    fn meter_mut(&mut self, id: &str) -> Result<&mut Meter, StoreError> {
        self.meters
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::UnknownMeter(id.to_string()))
    }

    pub fn has_family(&self, name: &str) -> bool {
        self.families.iter().any(|f| f == name)
    }

    fn require_family(&self, name: &str) -> Result<(), StoreError> {
        if self.has_family(name) {
            Ok(())
        } else {
            Err(StoreError::UnknownFamily(name.to_string()))
        }
    }

    pub fn meters_in<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a Meter> + 'a {
        self.meters.iter().filter(move |m| m.family == family)
    }

    /// Record a daily reading. No validation happens here.
    pub fn add_reading(&mut self, meter_id: &str, value: f64, now: OffsetDateTime) -> Result<bool, StoreError> {
        let meter = self.meter_mut(meter_id)?;

        let base_id = Reading::id_at(now);
        let mut id = base_id.clone();
        let mut suffix = 1;
        while meter.history.iter().any(|r| r.id == id) {
            id = format!("{base_id}-{suffix}");
            suffix += 1;
        }

        meter.latest_reading = value;
        meter.last_updated = now;
        meter.history.insert(0, Reading { id, date: now, value });
        Ok(true)
    }

    /// Lock `month` and start a new cycle from `value`. Daily history is not
    /// touched.
    pub fn submit_monthly_reading(
        &mut self,
        meter_id: &str,
        month: &MonthKey,
        value: f64,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let meter = self.meter_mut(meter_id)?;
        meter.monthly_baselines.insert(month.clone(), value);
        meter.last_month_reading = value;
        meter.last_updated = now;
        Ok(true)
    }

    /// Correct a month's closing without moving the running baseline.
    pub fn update_meter_monthly_baseline(
        &mut self,
        meter_id: &str,
        month: &MonthKey,
        value: f64,
    ) -> Result<bool, StoreError> {
        let meter = self.meter_mut(meter_id)?;
        meter.monthly_baselines.insert(month.clone(), value);
        Ok(true)
    }

    pub fn set_meter_as_current(&mut self, meter_id: &str) -> Result<bool, StoreError> {
        let family = self
            .meter(meter_id)
            .map(|m| m.family.clone())
            .ok_or_else(|| StoreError::UnknownMeter(meter_id.to_string()))?;

        let mut changed = false;
        for meter in self.meters.iter_mut().filter(|m| m.family == family) {
            let is_current = meter.id == meter_id;
            if meter.is_current != is_current {
                meter.is_current = is_current;
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn add_family(&mut self, name: &str, color: &str) -> Result<bool, StoreError> {
        if self.has_family(name) {
            return Ok(false);
        }
        self.families.push(name.to_string());
        self.family_themes.insert(name.to_string(), color.to_string());
        Ok(true)
    }

    /// Rename and recolor a family. Meters follow the rename.
    pub fn update_family(&mut self, old_name: &str, new_name: &str, color: &str) -> Result<bool, StoreError> {
        self.require_family(old_name)?;
        if old_name != new_name && self.has_family(new_name) {
            return Err(StoreError::DuplicateFamily(new_name.to_string()));
        }

        for family in self.families.iter_mut().filter(|f| f.as_str() == old_name) {
            *family = new_name.to_string();
        }
        self.family_themes.remove(old_name);
        self.family_themes.insert(new_name.to_string(), color.to_string());

        if old_name != new_name {
            for meter in self.meters.iter_mut().filter(|m| m.family == old_name) {
                meter.family = new_name.to_string();
            }
        }
        Ok(true)
    }

    pub fn delete_family(&mut self, name: &str) -> Result<bool, StoreError> {
        self.require_family(name)?;
        if !can_delete_family(&self.meters, name) {
            return Err(StoreError::FamilyInUse {
                family: name.to_string(),
                meters: self.meters_in(name).count(),
            });
        }

        self.families.retain(|f| f != name);
        self.family_themes.remove(name);
        Ok(true)
    }

    pub fn add_meter(&mut self, new: NewMeter, now: OffsetDateTime) -> Result<bool, StoreError> {
        if self.meter(&new.id).is_some() {
            return Err(StoreError::DuplicateMeter(new.id));
        }
        self.require_family(&new.family)?;

        self.meters
            .push(Meter::new(new.id, new.name, new.meter_number, new.family, now));
        Ok(true)
    }

    pub fn update_meter(&mut self, id: &str, patch: MeterPatch) -> Result<bool, StoreError> {
        if let Some(family) = &patch.family {
            self.require_family(family)?;
        }

        // A current meter moving into a family that already has one loses its flag.
        let target_has_current = match &patch.family {
            Some(family) => self
                .meters_in(family)
                .any(|m| m.is_current && m.id != id),
            None => false,
        };

        let meter = self.meter_mut(id)?;
        if let Some(name) = patch.name {
            meter.name = name;
        }
        if let Some(number) = patch.meter_number {
            meter.meter_number = number;
        }
        if let Some(family) = patch.family {
            if meter.family != family && meter.is_current && target_has_current {
                meter.is_current = false;
            }
            meter.family = family;
        }
        Ok(true)
    }

    pub fn delete_meter(&mut self, id: &str) -> Result<bool, StoreError> {
        let before = self.meters.len();
        self.meters.retain(|m| m.id != id);
        if self.meters.len() == before {
            return Err(StoreError::UnknownMeter(id.to_string()));
        }
        Ok(true)
    }

    /// Content hash used to recognise snapshots identical to local state.
    pub fn fingerprint(&self) -> blake3::Hash {
        let mut h = blake3::Hasher::new();
        hash_len(&mut h, self.meters.len());
        for meter in &self.meters {
            hash_meter(&mut h, meter);
        }
        hash_len(&mut h, self.families.len());
        for family in &self.families {
            hash_str(&mut h, family);
        }
        hash_len(&mut h, self.family_themes.len());
        for (family, color) in &self.family_themes {
            hash_str(&mut h, family);
            hash_str(&mut h, color);
        }
        h.finalize()
    }
}

fn hash_len(hasher: &mut blake3::Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hash_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn hash_ts(hasher: &mut blake3::Hasher, ts: OffsetDateTime) {
    hasher.update(&ts.unix_timestamp_nanos().to_le_bytes());
}

fn hash_meter(h: &mut blake3::Hasher, m: &Meter) {
    hash_str(h, &m.id);
    hash_str(h, &m.name);
    hash_str(h, &m.meter_number);
    hash_str(h, &m.family);
    h.update(&[u8::from(m.is_current)]);
    hash_f64(h, m.last_month_reading);
    hash_f64(h, m.latest_reading);
    hash_ts(h, m.last_updated);

    hash_len(h, m.history.len());
    for r in &m.history {
        hash_str(h, &r.id);
        hash_ts(h, r.date);
        hash_f64(h, r.value);
    }

    hash_len(h, m.monthly_baselines.len());
    for (month, value) in &m.monthly_baselines {
        hash_str(h, month.as_str());
        hash_f64(h, *value);
    }
}
