use anyhow::{bail, Result};
use meter_service::{
    config::AppConfig,
    import::{import_rows, read_rows, ImportConfirmer},
    observability, repository,
    store::{run_sync, MeterStore},
};
use std::{env, fs::File, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_readings <csv_file_path> [--confirm-lower]");
    }
    let file_path = &args[1];
    let confirm_lower = args[2..].iter().any(|a| a == "--confirm-lower");

    // Load configuration (METER_CONFIG can point at a different store).
    let cfg = AppConfig::load()?;

    let repository = repository::from_config(&cfg.store).await?;
    let store = MeterStore::new(repository);
    tokio::spawn(run_sync(store.clone()));
    store.wait_until_loaded().await;
    if let Some(e) = store.status().last_error {
        bail!("cannot import against an unsynced store: {e}");
    }

    let file = File::open(file_path).map_err(|e| anyhow::anyhow!("failed to open {file_path}: {e}"))?;
    let summary = import_rows(&store, &ImportConfirmer { confirm_lower }, read_rows(file)).await?;

    // Mutations only queue their writes.
    if tokio::time::timeout(Duration::from_secs(30), store.flush()).await.is_err() {
        bail!("timed out waiting for imported readings to be written");
    }
    if let Some(e) = store.status().last_error {
        bail!("import finished but the last write failed: {e}");
    }

    tracing::info!(
        file = %file_path,
        accepted = summary.accepted,
        declined = summary.declined,
        rejected = summary.rejected,
        "import finished"
    );

    Ok(())
}
