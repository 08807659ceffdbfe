//! Operator data-entry flows: validate, ask for confirmation where a rule
//! calls for it, then commit through the store.

use std::sync::Arc;

use meter_client::domain::{Meter, MonthKey};

use crate::{
    confirm::{ConfirmationRequest, Confirmer, DialogVariant},
    store::{MeterState, MeterStore, StoreError},
    validation::{
        can_delete_family, record_daily_outcome, validate_daily_reading, validate_monthly_reading,
        DailyReadingOutcome, ReadingError,
    },
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EntryError {
    #[error(transparent)]
    Reading(#[from] ReadingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{month} is already locked for meter '{meter_id}'")]
    MonthLocked { meter_id: String, month: MonthKey },
    #[error("{month} is not locked for meter '{meter_id}'")]
    MonthNotLocked { meter_id: String, month: MonthKey },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Committed(Arc<MeterState>),
    /// The operator dismissed this request; nothing changed.
    Declined(ConfirmationRequest),
}

fn require_meter(store: &MeterStore, meter_id: &str) -> Result<Meter, EntryError> {
    store.ensure_loaded()?;
    store
        .meter(meter_id)
        .ok_or_else(|| StoreError::UnknownMeter(meter_id.to_string()).into())
}

pub async fn record_daily_reading(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    meter_id: &str,
    raw: &str,
) -> Result<EntryOutcome, EntryError> {
    let meter = require_meter(store, meter_id)?;

    let outcome = validate_daily_reading(&meter, raw);
    record_daily_outcome(&outcome);

    let value = match outcome {
        DailyReadingOutcome::Accepted(v) => v,
        DailyReadingOutcome::NeedsConfirmation { value, previous } => {
            let request = ConfirmationRequest::new(
                "Lower Reading Detected",
                format!(
                    "The new reading ({value}) is lower than the last recorded entry ({previous}). Are you sure this is correct?"
                ),
                DialogVariant::Danger,
                "Yes, Save it",
            );
            if !confirmer.request_confirmation(&request).await {
                tracing::info!(meter_id, value, previous, "lower daily reading declined");
                return Ok(EntryOutcome::Declined(request));
            }

            // The baseline may have moved while the operator was deciding.
            let meter = require_meter(store, meter_id)?;
            if let DailyReadingOutcome::Rejected(e) = validate_daily_reading(&meter, raw) {
                tracing::info!(meter_id, error = %e, "confirmed daily reading rejected after baseline change");
                return Err(e.into());
            }
            value
        }
        DailyReadingOutcome::Rejected(e) => {
            tracing::info!(meter_id, error = %e, "daily reading rejected");
            return Err(e.into());
        }
    };

    let state = store.add_reading(meter_id, value)?;
    tracing::info!(meter_id, value, "daily reading recorded");
    Ok(EntryOutcome::Committed(state))
}

/// Lock a month that has no closing yet.
pub async fn lock_monthly_reading(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    meter_id: &str,
    month: &MonthKey,
    raw: &str,
) -> Result<EntryOutcome, EntryError> {
    let meter = require_meter(store, meter_id)?;
    if meter.is_locked(month) {
        return Err(EntryError::MonthLocked {
            meter_id: meter_id.to_string(),
            month: month.clone(),
        });
    }

    let value = validate_monthly_reading(raw)?;
    let month_name = month.display_name();
    let request = ConfirmationRequest::new(
        format!("Lock Reading for {month_name}?"),
        format!("You are about to save {value} as the reading for {month_name}. This will update the usage counter."),
        DialogVariant::Success,
        "Lock & Save",
    );
    if !confirmer.request_confirmation(&request).await {
        return Ok(EntryOutcome::Declined(request));
    }

    let state = store.submit_monthly_reading(meter_id, month, value)?;
    tracing::info!(meter_id, month = %month, value, "monthly reading locked");
    Ok(EntryOutcome::Committed(state))
}

/// Unlock and correct a locked month.
///
/// Correcting the latest locked month moves the running baseline with it;
/// older months are corrected in place.
pub async fn edit_locked_month(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    meter_id: &str,
    month: &MonthKey,
    raw: &str,
) -> Result<EntryOutcome, EntryError> {
    let meter = require_meter(store, meter_id)?;
    if !meter.is_locked(month) {
        return Err(EntryError::MonthNotLocked {
            meter_id: meter_id.to_string(),
            month: month.clone(),
        });
    }

    let value = validate_monthly_reading(raw)?;
    let request = ConfirmationRequest::new(
        "Edit Locked Reading",
        "Are you sure you want to edit a locked reading? This may affect usage calculations for that month.",
        DialogVariant::Danger,
        "Yes, Edit",
    );
    if !confirmer.request_confirmation(&request).await {
        return Ok(EntryOutcome::Declined(request));
    }

    let state = if meter.latest_locked_month() == Some(month) {
        store.submit_monthly_reading(meter_id, month, value)?
    } else {
        store.update_meter_monthly_baseline(meter_id, month, value)?
    };
    tracing::warn!(meter_id, month = %month, value, "locked monthly reading edited");
    Ok(EntryOutcome::Committed(state))
}

pub async fn remove_family(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    name: &str,
) -> Result<EntryOutcome, EntryError> {
    store.ensure_loaded()?;
    let state = store.snapshot();
    if !state.has_family(name) {
        return Err(StoreError::UnknownFamily(name.to_string()).into());
    }
    if !can_delete_family(&state.meters, name) {
        return Err(StoreError::FamilyInUse {
            family: name.to_string(),
            meters: state.meters_in(name).count(),
        }
        .into());
    }

    let request = ConfirmationRequest::new(
        "Delete Family",
        format!("Are you sure you want to delete family \"{name}\"?"),
        DialogVariant::Danger,
        "Delete",
    );
    if !confirmer.request_confirmation(&request).await {
        return Ok(EntryOutcome::Declined(request));
    }

    let state = store.delete_family(name)?;
    tracing::info!(family = name, "family deleted");
    Ok(EntryOutcome::Committed(state))
}

pub async fn remove_meter(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    meter_id: &str,
) -> Result<EntryOutcome, EntryError> {
    require_meter(store, meter_id)?;

    let request = ConfirmationRequest::new(
        "Delete Meter",
        "Are you sure you want to delete this meter? This action cannot be undone.",
        DialogVariant::Danger,
        "Delete",
    );
    if !confirmer.request_confirmation(&request).await {
        return Ok(EntryOutcome::Declined(request));
    }

    let state = store.delete_meter(meter_id)?;
    tracing::info!(meter_id, "meter deleted");
    Ok(EntryOutcome::Committed(state))
}
