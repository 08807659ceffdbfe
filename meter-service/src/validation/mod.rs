use meter_client::domain::Meter;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReadingError {
    #[error("'{0}' is not a valid number")]
    Parse(String),
    #[error("reading {value} is lower than the previous month's reading ({baseline})")]
    BelowBaseline { value: f64, baseline: f64 },
    #[error("reading {0} cannot be negative")]
    NegativeValue(f64),
}

impl ReadingError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::BelowBaseline { .. } => "below_baseline",
            Self::NegativeValue(_) => "negative_value",
        }
    }
}

/// Decision for a proposed daily reading.
#[derive(Debug, Clone, PartialEq)]
pub enum DailyReadingOutcome {
    Accepted(f64),
    /// Lower than the last recorded entry but not below the baseline. Commit
    /// only after the user confirms.
    NeedsConfirmation { value: f64, previous: f64 },
    Rejected(ReadingError),
}

/// Parse operator input as a finite decimal number.
pub fn parse_reading(raw: &str) -> Result<f64, ReadingError> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ReadingError::Parse(trimmed.to_string())),
    }
}

/// Pure validation of a daily reading against a meter's current cycle.
///
/// Rules, in order:
/// - input must parse as a number;
/// - value must not be below `last_month_reading`;
/// - value must not be negative;
/// - a value below `latest_reading` needs confirmation.
pub fn validate_daily_reading(meter: &Meter, raw: &str) -> DailyReadingOutcome {
    let value = match parse_reading(raw) {
        Ok(v) => v,
        Err(e) => return DailyReadingOutcome::Rejected(e),
    };

    if value < meter.last_month_reading {
        return DailyReadingOutcome::Rejected(ReadingError::BelowBaseline {
            value,
            baseline: meter.last_month_reading,
        });
    }

    if value < 0.0 {
        return DailyReadingOutcome::Rejected(ReadingError::NegativeValue(value));
    }

    if value < meter.latest_reading {
        return DailyReadingOutcome::NeedsConfirmation {
            value,
            previous: meter.latest_reading,
        };
    }

    DailyReadingOutcome::Accepted(value)
}

/// Monthly closings come from a bill and may be corrections, so only
/// parseability is enforced.
pub fn validate_monthly_reading(raw: &str) -> Result<f64, ReadingError> {
    parse_reading(raw)
}

pub fn can_delete_family(meters: &[Meter], family: &str) -> bool {
    !meters.iter().any(|m| m.family == family)
}

/// Count rejections and soft warnings.
pub fn record_daily_outcome(outcome: &DailyReadingOutcome) {
    match outcome {
        DailyReadingOutcome::Accepted(_) => {}
        DailyReadingOutcome::NeedsConfirmation { .. } => {
            metrics::counter!("validation_daily_reading_soft_warning_total").increment(1);
        }
        DailyReadingOutcome::Rejected(e) => {
            metrics::counter!("validation_daily_reading_rejected_total", "kind" => e.kind()).increment(1);
        }
    }
}
