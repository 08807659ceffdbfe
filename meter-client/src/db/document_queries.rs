use anyhow::Result;
use sqlx::{types::Json, PgPool};
use time::OffsetDateTime;

use crate::domain::MeterDocument;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: String,
    pub body: Json<MeterDocument>,
    pub last_modified: OffsetDateTime,
}

/// Create the document table if it is missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meter_documents (
            id            TEXT PRIMARY KEY,
            body          JSONB NOT NULL,
            last_modified TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch the shared document, or `None` when it has never been written.
pub async fn fetch_document(pool: &PgPool, document_id: &str) -> Result<Option<MeterDocument>> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT
            id,
            body,
            last_modified
        FROM meter_documents
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.body.0))
}

/// Replace the whole document and notify listeners on `notify_channel`.
///
/// Upsert and notification share a transaction, so listeners are only woken
/// once the new body is visible.
pub async fn replace_document(
    pool: &PgPool,
    document_id: &str,
    notify_channel: &str,
    document: &MeterDocument,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO meter_documents (id, body, last_modified)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET body = EXCLUDED.body,
            last_modified = EXCLUDED.last_modified
        "#,
    )
    .bind(document_id)
    .bind(Json(document))
    .bind(document.last_modified)
    .execute(&mut *tx)
    .await?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(notify_channel)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}
