use std::{pin::Pin, sync::Arc};

use futures::Stream;
use meter_client::domain::MeterDocument;

use crate::config::{StoreBackend, StoreConfig};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgDocumentRepository;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("sync error: {0}")]
    Sync(String),
    #[error("sync permission denied: {0}")]
    PermissionDenied(String),
}

/// One item per remote change: the full document, or `None` when no
/// document exists yet.
pub type Snapshot = Result<Option<MeterDocument>, RepositoryError>;

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Snapshot> + Send>>;

/// The external document store. Exactly two operations are needed: watch the
/// shared record and replace it wholesale.
#[async_trait::async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Stream of snapshots. The first item reflects the current record.
    async fn subscribe(&self) -> SnapshotStream;

    /// Atomic whole-record write. Last write wins.
    async fn replace_all(&self, document: &MeterDocument) -> Result<(), RepositoryError>;
}

/// Build the repository selected by `[store]`.
pub async fn from_config(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn DocumentRepository>> {
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory document store; data is lost on exit");
            Ok(Arc::new(InMemoryRepository::new()))
        }
        StoreBackend::Postgres => {
            let uri = cfg
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres backend"))?;
            let repo =
                PgDocumentRepository::connect(uri, cfg.max_connections, &cfg.document_id, &cfg.notify_channel)
                    .await?;
            tracing::info!(document_id = %cfg.document_id, channel = %cfg.notify_channel, "connected to postgres document store");
            Ok(Arc::new(repo))
        }
    }
}
