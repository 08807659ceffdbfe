use anyhow::{bail, Result};
use meter_service::{
    config::AppConfig,
    observability,
    projection::{family_usage, project_monthly_billing},
    repository,
    store::{run_sync, MeterStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let repository = repository::from_config(&cfg.store).await?;
    let store = MeterStore::new(repository);
    tokio::spawn(run_sync(store.clone()));
    store.wait_until_loaded().await;
    if let Some(e) = store.status().last_error {
        bail!("failed to load meter document: {e}");
    }

    let state = store.snapshot();

    for usage in family_usage(&state) {
        tracing::info!(
            family = %usage.family,
            color = usage.color.as_deref().unwrap_or("-"),
            meters = usage.meter_count,
            current_meter = usage.current_meter.as_deref().unwrap_or("-"),
            total_units = usage.total_units,
            "family usage"
        );

        for meter in state.meters_in(&usage.family) {
            let rows = project_monthly_billing(&meter.monthly_baselines, meter.latest_reading);
            match rows.first() {
                Some(running) => tracing::info!(
                    family = %usage.family,
                    meter_id = %meter.id,
                    month = %running.month,
                    closing = running.closing_reading,
                    units = running.units,
                    "running cycle"
                ),
                None => tracing::info!(
                    family = %usage.family,
                    meter_id = %meter.id,
                    units = meter.units_used(),
                    "no locked months yet"
                ),
            }
        }
    }

    Ok(())
}
