use std::time::Instant;

use meter_client::{
    db::document_queries::{ensure_schema, fetch_document, replace_document},
    domain::MeterDocument,
};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};

use super::{DocumentRepository, RepositoryError, SnapshotStream};

const PERMISSION_DENIED: &str = "42501";

/// Postgres-backed document store: one JSONB row per document id, change
/// notification through LISTEN/NOTIFY.
pub struct PgDocumentRepository {
    pool: PgPool,
    document_id: String,
    notify_channel: String,
}

impl PgDocumentRepository {
    pub fn new(pool: PgPool, document_id: impl Into<String>, notify_channel: impl Into<String>) -> Self {
        Self {
            pool,
            document_id: document_id.into(),
            notify_channel: notify_channel.into(),
        }
    }

    pub async fn connect(
        uri: &str,
        max_connections: u32,
        document_id: &str,
        notify_channel: &str,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        ensure_schema(&pool).await?;
        Ok(Self::new(pool, document_id, notify_channel))
    }
}

fn is_permission_denied(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == PERMISSION_DENIED)
        .unwrap_or(false)
}

fn sync_error(err: &sqlx::Error) -> RepositoryError {
    if is_permission_denied(err) {
        RepositoryError::PermissionDenied(err.to_string())
    } else {
        RepositoryError::Sync(err.to_string())
    }
}

fn sync_error_from_query(err: &anyhow::Error) -> RepositoryError {
    match err.downcast_ref::<sqlx::Error>() {
        Some(e) => sync_error(e),
        None => RepositoryError::Sync(err.to_string()),
    }
}

#[async_trait::async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn subscribe(&self) -> SnapshotStream {
        let pool = self.pool.clone();
        let document_id = self.document_id.clone();
        let channel = self.notify_channel.clone();

        let s = async_stream::stream! {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(l) => l,
                Err(e) => {
                    yield Err(sync_error(&e));
                    return;
                }
            };
            if let Err(e) = listener.listen(&channel).await {
                yield Err(sync_error(&e));
                return;
            }

            // The listener is registered before this read, so no write can fall
            // between the two.
            match fetch_document(&pool, &document_id).await {
                Ok(doc) => yield Ok(doc),
                Err(e) => {
                    yield Err(sync_error_from_query(&e));
                    return;
                }
            }

            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        yield Err(sync_error(&e));
                        return;
                    }
                };
                if notification.payload() != document_id {
                    continue;
                }

                match fetch_document(&pool, &document_id).await {
                    Ok(doc) => yield Ok(doc),
                    Err(e) => {
                        yield Err(sync_error_from_query(&e));
                        return;
                    }
                }
            }
        };

        Box::pin(s)
    }

    async fn replace_all(&self, document: &MeterDocument) -> Result<(), RepositoryError> {
        let started = Instant::now();
        replace_document(&self.pool, &self.document_id, &self.notify_channel, document)
            .await
            .map_err(|e| RepositoryError::Persistence(e.to_string()))?;

        metrics::histogram!("pg_document_write_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_plain_sync_errors() {
        let err = sqlx::Error::PoolTimedOut;
        assert!(!is_permission_denied(&err));
        assert!(matches!(sync_error(&err), RepositoryError::Sync(_)));

        let wrapped = anyhow::anyhow!("decode failed");
        assert!(matches!(sync_error_from_query(&wrapped), RepositoryError::Sync(_)));
    }
}
