use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use futures::{stream, StreamExt};
use meter_client::domain::MeterDocument;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{DocumentRepository, RepositoryError, SnapshotStream};

/// Process-local document store. Backs the `memory` backend and the tests.
///
/// Writes are echoed to every subscriber, like a realtime store echoing a
/// client's own writes back to it.
pub struct InMemoryRepository {
    document: watch::Sender<Option<MeterDocument>>,
    writes: watch::Sender<usize>,
    fail_writes: AtomicBool,
    subscribe_error: Mutex<Option<RepositoryError>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::from_document(None)
    }

    pub fn with_document(document: MeterDocument) -> Self {
        Self::from_document(Some(document))
    }

    fn from_document(document: Option<MeterDocument>) -> Self {
        let (document, _) = watch::channel(document);
        let (writes, _) = watch::channel(0);
        Self {
            document,
            writes,
            fail_writes: AtomicBool::new(false),
            subscribe_error: Mutex::new(None),
        }
    }

    pub fn document(&self) -> Option<MeterDocument> {
        self.document.borrow().clone()
    }

    /// Simulate a change made by another client.
    pub fn push_remote(&self, document: MeterDocument) {
        self.document.send_replace(Some(document));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next subscription yields `err` and then ends.
    pub fn fail_next_subscribe(&self, err: RepositoryError) {
        if let Ok(mut slot) = self.subscribe_error.lock() {
            *slot = Some(err);
        }
    }

    /// Number of write attempts, successful or not.
    pub fn write_attempts(&self) -> usize {
        *self.writes.borrow()
    }

    pub async fn wait_for_write_attempts(&self, n: usize) {
        let mut rx = self.writes.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentRepository for InMemoryRepository {
    async fn subscribe(&self) -> SnapshotStream {
        let pending = self.subscribe_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(err) = pending {
            return Box::pin(stream::iter(vec![Err(err)]));
        }

        let rx = self.document.subscribe();
        Box::pin(WatchStream::new(rx).map(Ok))
    }

    async fn replace_all(&self, document: &MeterDocument) -> Result<(), RepositoryError> {
        let failed = self.fail_writes.load(Ordering::SeqCst);
        if !failed {
            self.document.send_replace(Some(document.clone()));
        }
        self.writes.send_modify(|count| *count += 1);

        if failed {
            return Err(RepositoryError::Persistence("simulated write failure".to_string()));
        }
        Ok(())
    }
}
