use anyhow::Result;
use meter_service::{config::AppConfig, http_api, metrics_server, observability, repository, store};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let repository = repository::from_config(&cfg.store).await?;
    let meter_store = store::MeterStore::new(repository);

    // Follow the shared document for the life of the process.
    let mut sync = tokio::spawn(store::run_sync(meter_store.clone()));

    // Serving before the first snapshot would let a write replace the shared
    // record with an empty state.
    tokio::select! {
        _ = meter_store.wait_until_loaded() => {}
        _ = &mut sync => anyhow::bail!("meter document subscription ended before loading"),
    }
    tracing::info!(meters = meter_store.snapshot().meters.len(), "meter document loaded");

    tokio::select! {
        res = http_api::serve(&cfg.api.bind_addr, meter_store) => res?,
        _ = sync => anyhow::bail!("meter document subscription ended"),
    }

    Ok(())
}
