use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Month, OffsetDateTime, UtcOffset};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MonthKeyError {
    #[error("month key '{0}' is not in YYYY-MM form")]
    Format(String),
    #[error("month key '{0}' has a month outside 01-12")]
    Month(String),
}

/// Billing month identifier in `YYYY-MM` form.
///
/// The zero-padded representation makes lexicographic order equal to
/// chronological order, so keys can be sorted as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    pub fn new(year: i32, month: Month) -> Self {
        Self(format!("{:04}-{:02}", year, u8::from(month)))
    }

    /// Month (in UTC) that contains `ts`.
    pub fn containing(ts: OffsetDateTime) -> Self {
        let utc = ts.to_offset(UtcOffset::UTC);
        Self::new(utc.year(), utc.month())
    }

    pub fn parse(raw: &str) -> Result<Self, MonthKeyError> {
        let raw = raw.trim();
        let (year, month) = raw
            .split_once('-')
            .ok_or_else(|| MonthKeyError::Format(raw.to_string()))?;

        if year.len() != 4
            || month.len() != 2
            || !year.bytes().all(|b| b.is_ascii_digit())
            || !month.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(MonthKeyError::Format(raw.to_string()));
        }

        let month_num: u8 = month
            .parse()
            .map_err(|_| MonthKeyError::Format(raw.to_string()))?;
        if !(1..=12).contains(&month_num) {
            return Err(MonthKeyError::Month(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year(&self) -> i32 {
        self.0[..4].parse().unwrap_or_default()
    }

    pub fn month(&self) -> Month {
        self.0[5..]
            .parse::<u8>()
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .unwrap_or(Month::January)
    }

    /// Human label such as "March 2024".
    pub fn display_name(&self) -> String {
        format!("{} {}", self.month(), self.year())
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = MonthKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for MonthKey {
    type Err = MonthKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_well_formed_keys() {
        let key = MonthKey::parse("2024-03").unwrap();
        assert_eq!(key.year(), 2024);
        assert_eq!(key.month(), Month::March);
        assert_eq!(key.display_name(), "March 2024");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(MonthKey::parse("2024-3"), Err(MonthKeyError::Format(_))));
        assert!(matches!(MonthKey::parse("24-03"), Err(MonthKeyError::Format(_))));
        assert!(matches!(MonthKey::parse("2024/03"), Err(MonthKeyError::Format(_))));
        assert!(matches!(MonthKey::parse("2024-13"), Err(MonthKeyError::Month(_))));
        assert!(matches!(MonthKey::parse("2024-00"), Err(MonthKeyError::Month(_))));
    }

    #[test]
    fn ordering_is_chronological() {
        let mut keys = vec![
            MonthKey::parse("2024-10").unwrap(),
            MonthKey::parse("2023-12").unwrap(),
            MonthKey::parse("2024-02").unwrap(),
        ];
        keys.sort();
        let ordered: Vec<&str> = keys.iter().map(MonthKey::as_str).collect();
        assert_eq!(ordered, vec!["2023-12", "2024-02", "2024-10"]);
    }

    #[test]
    fn containing_uses_utc_month() {
        let ts = datetime!(2024-04-01 01:30:00 +03:00);
        assert_eq!(MonthKey::containing(ts).as_str(), "2024-03");
    }

    #[test]
    fn serializes_as_plain_string_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(MonthKey::parse("2024-01").unwrap(), 10.0);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"2024-01":10.0}"#);

        let back: std::collections::BTreeMap<MonthKey, f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        assert!(serde_json::from_str::<std::collections::BTreeMap<MonthKey, f64>>(r#"{"bad":1}"#).is_err());
    }
}
