use futures::StreamExt;

use super::MeterStore;
use crate::repository::RepositoryError;

/// Follow the shared document until the subscription ends.
///
/// Remote snapshots replace local state wholesale, including local changes
/// whose write has not landed yet. An empty store is seeded once with the
/// default dataset.
pub async fn run_sync(store: MeterStore) {
    let repository = store.repository();
    let mut snapshots = repository.subscribe().await;

    while let Some(snapshot) = snapshots.next().await {
        match snapshot {
            Ok(Some(document)) => {
                metrics::counter!("sync_remote_snapshots_total").increment(1);
                let meters = document.meters.len();
                if store.apply_remote(document) {
                    tracing::info!(meters, "applied remote meter document");
                } else {
                    tracing::debug!("remote meter document matches local state");
                }
            }
            Ok(None) => {
                tracing::info!("no shared meter document yet, seeding defaults");
                store.seed_defaults();
            }
            Err(e) => {
                let permission_denied = matches!(e, RepositoryError::PermissionDenied(_));
                tracing::error!(error = %e, permission_denied, "meter document sync failed");
                metrics::counter!("sync_errors_total").increment(1);
                store.record_sync_error(e);
            }
        }
    }

    tracing::warn!("meter document subscription ended");
}
