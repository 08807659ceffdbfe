//! Bulk reading import from CSV, routed through the same entry flows an
//! operator would use.

use std::io::Read;

use csv::StringRecord;
use futures::{Stream, StreamExt};
use meter_client::domain::MonthKey;

use crate::{
    confirm::{ConfirmationRequest, Confirmer, DialogVariant},
    entry::{self, EntryOutcome},
    store::MeterStore,
};

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: {message}")]
    Row { line: u64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub line: u64,
    pub meter_id: String,
    pub kind: RowKind,
    /// Only set for monthly rows.
    pub month: Option<MonthKey>,
    /// Unparsed; validation happens in the entry flow.
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub accepted: u64,
    pub declined: u64,
    pub rejected: u64,
}

/// Answers for unattended imports. A monthly row in the file is itself the
/// decision to lock; lower daily readings pass only with `confirm_lower`.
#[derive(Debug, Clone, Copy)]
pub struct ImportConfirmer {
    pub confirm_lower: bool,
}

#[async_trait::async_trait]
impl Confirmer for ImportConfirmer {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> bool {
        match request.variant {
            DialogVariant::Danger => self.confirm_lower,
            DialogVariant::Success | DialogVariant::Info => true,
        }
    }
}

fn record_to_row(record: &StringRecord, headers: &StringRecord) -> Result<ImportRow, ImportError> {
    let line = record.position().map(|p| p.line()).unwrap_or_default();
    let row_error = |message: String| ImportError::Row { line, message };

    let get = |name: &str| -> Result<&str, ImportError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .ok_or_else(|| row_error(format!("missing column '{name}'")))
    };

    let meter_id = get("meter_id")?;
    if meter_id.is_empty() {
        return Err(row_error("empty meter_id".to_string()));
    }

    let kind = match get("kind")? {
        "daily" => RowKind::Daily,
        "monthly" => RowKind::Monthly,
        other => return Err(row_error(format!("unknown kind '{other}'"))),
    };

    let month = match kind {
        RowKind::Daily => None,
        RowKind::Monthly => {
            let raw = get("month")?;
            Some(MonthKey::parse(raw).map_err(|e| row_error(e.to_string()))?)
        }
    };

    Ok(ImportRow {
        line,
        meter_id: meter_id.to_string(),
        kind,
        month,
        value: get("value")?.to_string(),
    })
}

/// Rows of a CSV with header `meter_id,kind,month,value`. A malformed row
/// yields [`ImportError::Row`] and the stream continues; an unreadable file
/// ends it.
pub fn read_rows<R>(reader: R) -> impl Stream<Item = Result<ImportRow, ImportError>>
where
    R: Read + Send + 'static,
{
    async_stream::stream! {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = match rdr.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                yield Err(ImportError::Csv(e));
                return;
            }
        };

        for result in rdr.records() {
            match result {
                Ok(record) => yield record_to_row(&record, &headers),
                Err(e) => {
                    yield Err(ImportError::Csv(e));
                    return;
                }
            }
        }
    }
}

/// Feed `rows` through the entry flows in file order.
pub async fn import_rows<S>(
    store: &MeterStore,
    confirmer: &dyn Confirmer,
    rows: S,
) -> Result<ImportSummary, ImportError>
where
    S: Stream<Item = Result<ImportRow, ImportError>>,
{
    let mut summary = ImportSummary::default();
    futures::pin_mut!(rows);

    while let Some(row) = rows.next().await {
        let row = match row {
            Ok(row) => row,
            Err(ImportError::Row { line, message }) => {
                tracing::warn!(line, error = %message, "skipping malformed row");
                metrics::counter!("import_rows_malformed_total").increment(1);
                summary.rejected += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let outcome = match (&row.kind, &row.month) {
            (RowKind::Monthly, Some(month)) => {
                entry::lock_monthly_reading(store, confirmer, &row.meter_id, month, &row.value).await
            }
            _ => entry::record_daily_reading(store, confirmer, &row.meter_id, &row.value).await,
        };

        match outcome {
            Ok(EntryOutcome::Committed(_)) => summary.accepted += 1,
            Ok(EntryOutcome::Declined(request)) => {
                tracing::info!(line = row.line, meter_id = %row.meter_id, title = %request.title, "row declined");
                summary.declined += 1;
            }
            Err(e) => {
                tracing::warn!(line = row.line, meter_id = %row.meter_id, error = %e, "row rejected");
                summary.rejected += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use super::*;
    use crate::repository::InMemoryRepository;
    use meter_client::domain::seed::seed_document;
    use time::macros::datetime;

    const CSV: &str = "\
meter_id,kind,month,value
m1,daily,,150
m1,daily,,140
m1,monthly,2024-03,160
m2,weekly,,5
m3,monthly,2024-3,5
m42,daily,,1
m4,daily,,abc
";

    fn store() -> MeterStore {
        let store = MeterStore::new(Arc::new(InMemoryRepository::new()));
        store.apply_remote(seed_document(datetime!(2024-03-01 00:00:00 UTC)));
        store
    }

    #[tokio::test]
    async fn rows_are_parsed_with_line_numbers() {
        let rows: Vec<_> = read_rows(Cursor::new(CSV.as_bytes().to_vec())).collect().await;
        assert_eq!(rows.len(), 7);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.line, 2);
        assert_eq!(first.kind, RowKind::Daily);
        assert!(first.month.is_none());

        let monthly = rows[2].as_ref().unwrap();
        assert_eq!(monthly.month.as_ref().map(MonthKey::as_str), Some("2024-03"));

        assert!(matches!(rows[3], Err(ImportError::Row { line: 5, .. })));
        assert!(matches!(rows[4], Err(ImportError::Row { line: 6, .. })));
    }

    #[tokio::test]
    async fn lower_readings_are_declined_without_flag() {
        let store = store();
        let rows = read_rows(Cursor::new(CSV.as_bytes().to_vec()));

        let confirmer = ImportConfirmer { confirm_lower: false };
        let summary = import_rows(&store, &confirmer, rows).await.unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                accepted: 2,
                declined: 1,
                rejected: 4
            }
        );
        let m1 = store.meter("m1").unwrap();
        assert_eq!(m1.latest_reading, 150.0);
        assert_eq!(m1.last_month_reading, 160.0);
    }

    #[tokio::test]
    async fn confirm_flag_accepts_soft_warnings() {
        let store = store();
        let rows = read_rows(Cursor::new(CSV.as_bytes().to_vec()));

        let confirmer = ImportConfirmer { confirm_lower: true };
        let summary = import_rows(&store, &confirmer, rows).await.unwrap();

        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.declined, 0);
        assert_eq!(store.meter("m1").unwrap().latest_reading, 140.0);
    }

    #[tokio::test]
    async fn unreadable_input_is_fatal() {
        let store = store();
        let rows = futures::stream::iter(vec![Err(ImportError::Csv(csv::Error::from(std::io::Error::other(
            "disk gone",
        ))))]);

        let err = import_rows(&store, &ImportConfirmer { confirm_lower: true }, rows)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Csv(_)));
    }
}
