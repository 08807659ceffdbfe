use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use meter_client::domain::{seed::seed_document, Meter, MeterDocument, MonthKey};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};

use crate::repository::{DocumentRepository, RepositoryError};

pub mod state;
pub mod sync;

pub use state::{MeterPatch, MeterState, NewMeter, StoreError};
pub use sync::run_sync;

/// Connection health as seen by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStatus {
    /// A snapshot (or the local fallback) has been loaded.
    pub loaded: bool,
    pub last_error: Option<RepositoryError>,
}

/// Fingerprints of documents this store queued and has not yet seen come
/// back from the repository, oldest first.
type PendingWrites = Arc<Mutex<VecDeque<blake3::Hash>>>;

fn lock_pending(pending: &Mutex<VecDeque<blake3::Hash>>) -> MutexGuard<'_, VecDeque<blake3::Hash>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct QueuedWrite {
    fingerprint: blake3::Hash,
    document: MeterDocument,
}

struct Inner {
    state: watch::Sender<Arc<MeterState>>,
    status: Arc<watch::Sender<StoreStatus>>,
    writes: mpsc::UnboundedSender<QueuedWrite>,
    pending: PendingWrites,
    queued: AtomicU64,
    /// Write attempts finished by the writer task, failed ones included.
    written: Arc<watch::Sender<u64>>,
    repository: Arc<dyn DocumentRepository>,
}

/// Authoritative in-memory meter state.
///
/// Each mutation builds the next full state, swaps it in under the state
/// channel's lock and queues the resulting document for the writer task.
/// Mutations never wait on the write; a failed write is logged and recorded
/// in [`StoreStatus::last_error`] but local state is kept.
///
/// Mutations are refused with [`StoreError::NotLoaded`] until a snapshot (or
/// the local fallback) has been loaded, so an empty state is never written
/// over the shared record.
#[derive(Clone)]
pub struct MeterStore {
    inner: Arc<Inner>,
}

impl MeterStore {
    /// Must be called inside a Tokio runtime: spawns the writer task.
    pub fn new(repository: Arc<dyn DocumentRepository>) -> Self {
        let (state, _) = watch::channel(Arc::new(MeterState::default()));
        let (status, _) = watch::channel(StoreStatus::default());
        let status = Arc::new(status);
        let (writes, rx) = mpsc::unbounded_channel();
        let (written, _) = watch::channel(0);
        let written = Arc::new(written);
        let pending = PendingWrites::default();

        tokio::spawn(write_loop(
            repository.clone(),
            rx,
            status.clone(),
            written.clone(),
            pending.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                state,
                status,
                writes,
                pending,
                queued: AtomicU64::new(0),
                written,
                repository,
            }),
        }
    }

    pub fn repository(&self) -> Arc<dyn DocumentRepository> {
        self.inner.repository.clone()
    }

    pub fn snapshot(&self) -> Arc<MeterState> {
        self.inner.state.borrow().clone()
    }

    pub fn meter(&self, id: &str) -> Option<Meter> {
        self.inner.state.borrow().meter(id).cloned()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<MeterState>> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> StoreStatus {
        self.inner.status.borrow().clone()
    }

    pub fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.inner.status.borrow().loaded {
            Ok(())
        } else {
            Err(StoreError::NotLoaded)
        }
    }

    pub async fn wait_until_loaded(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|s| s.loaded).await;
    }

    /// Wait until every document queued so far has been handed to the
    /// repository. Failures are reported through [`StoreStatus`].
    pub async fn flush(&self) {
        let target = self.inner.queued.load(Ordering::SeqCst);
        let mut rx = self.inner.written.subscribe();
        let _ = rx.wait_for(|n| *n >= target).await;
    }

    /// Must be called with the state channel locked so that queue order,
    /// pending order and commit order agree.
    fn queue_write(&self, state: &MeterState) -> bool {
        let fingerprint = state.fingerprint();
        let document = state.to_document(OffsetDateTime::now_utc());

        let mut pending = lock_pending(&self.inner.pending);
        if self
            .inner
            .writes
            .send(QueuedWrite { fingerprint, document })
            .is_err()
        {
            return false;
        }
        pending.push_back(fingerprint);
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn commit<F>(&self, op: &'static str, mutate: F) -> Result<Arc<MeterState>, StoreError>
    where
        F: FnOnce(&mut MeterState) -> Result<bool, StoreError>,
    {
        self.ensure_loaded()?;
        let mut outcome: Result<Option<Arc<MeterState>>, StoreError> = Ok(None);

        self.inner.state.send_if_modified(|current| {
            let mut next = MeterState::clone(current);
            match mutate(&mut next) {
                Ok(true) => {
                    let next = Arc::new(next);
                    // Queue while still holding the lock so writes keep commit order.
                    if !self.queue_write(&next) {
                        tracing::warn!(op, "document writer stopped; change kept locally only");
                    }
                    *current = next.clone();
                    outcome = Ok(Some(next));
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });

        match outcome? {
            Some(committed) => {
                metrics::counter!("store_mutations_total", "op" => op).increment(1);
                tracing::debug!(op, "committed meter state");
                Ok(committed)
            }
            None => Ok(self.snapshot()),
        }
    }

    pub fn add_reading(&self, meter_id: &str, value: f64) -> Result<Arc<MeterState>, StoreError> {
        let now = OffsetDateTime::now_utc();
        self.commit("add_reading", |s| s.add_reading(meter_id, value, now))
    }

    pub fn submit_monthly_reading(
        &self,
        meter_id: &str,
        month: &MonthKey,
        value: f64,
    ) -> Result<Arc<MeterState>, StoreError> {
        let now = OffsetDateTime::now_utc();
        self.commit("submit_monthly_reading", |s| {
            s.submit_monthly_reading(meter_id, month, value, now)
        })
    }

    pub fn update_meter_monthly_baseline(
        &self,
        meter_id: &str,
        month: &MonthKey,
        value: f64,
    ) -> Result<Arc<MeterState>, StoreError> {
        self.commit("update_meter_monthly_baseline", |s| {
            s.update_meter_monthly_baseline(meter_id, month, value)
        })
    }

    pub fn set_meter_as_current(&self, meter_id: &str) -> Result<Arc<MeterState>, StoreError> {
        self.commit("set_meter_as_current", |s| s.set_meter_as_current(meter_id))
    }

    pub fn add_family(&self, name: &str, color: &str) -> Result<Arc<MeterState>, StoreError> {
        self.commit("add_family", |s| s.add_family(name, color))
    }

    pub fn update_family(
        &self,
        old_name: &str,
        new_name: &str,
        color: &str,
    ) -> Result<Arc<MeterState>, StoreError> {
        self.commit("update_family", |s| s.update_family(old_name, new_name, color))
    }

    pub fn delete_family(&self, name: &str) -> Result<Arc<MeterState>, StoreError> {
        self.commit("delete_family", |s| s.delete_family(name))
    }

    pub fn add_meter(&self, new: NewMeter) -> Result<Arc<MeterState>, StoreError> {
        let now = OffsetDateTime::now_utc();
        self.commit("add_meter", |s| s.add_meter(new, now))
    }

    pub fn update_meter(&self, id: &str, patch: MeterPatch) -> Result<Arc<MeterState>, StoreError> {
        self.commit("update_meter", |s| s.update_meter(id, patch))
    }

    pub fn delete_meter(&self, id: &str) -> Result<Arc<MeterState>, StoreError> {
        self.commit("delete_meter", |s| s.delete_meter(id))
    }

    /// Replace local state with a remote snapshot. Returns whether anything
    /// changed.
    ///
    /// A snapshot equal to local state is ignored, as is the echo of one of
    /// this store's own writes that a later local commit has superseded.
    /// Snapshots from other writers replace local state wholesale.
    pub fn apply_remote(&self, document: MeterDocument) -> bool {
        let next = MeterState::from_document(document);
        let fingerprint = next.fingerprint();

        let changed = self.inner.state.send_if_modified(|current| {
            let mut pending = lock_pending(&self.inner.pending);
            if let Some(idx) = pending.iter().rposition(|f| *f == fingerprint) {
                let superseded = idx + 1 < pending.len();
                pending.drain(..=idx);
                if superseded {
                    tracing::debug!(still_pending = pending.len(), "ignoring echo of an older local write");
                    return false;
                }
            }
            drop(pending);

            if current.fingerprint() == fingerprint {
                return false;
            }
            *current = Arc::new(next);
            true
        });

        self.inner.status.send_modify(|s| {
            s.loaded = true;
            s.last_error = None;
        });
        changed
    }

    /// First run against an empty store: install and write the default dataset.
    pub fn seed_defaults(&self) {
        let seeded = Arc::new(MeterState::from_document(seed_document(OffsetDateTime::now_utc())));
        self.inner.state.send_modify(|current| {
            if !self.queue_write(&seeded) {
                tracing::warn!("document writer stopped; seed kept locally only");
            }
            *current = seeded.clone();
        });
        self.inner.status.send_modify(|s| s.loaded = true);
    }

    /// Surface a sync failure. Before anything was loaded, fall back to the
    /// default dataset locally (not written) so callers have data to work on.
    pub fn record_sync_error(&self, err: RepositoryError) {
        let loaded = self.inner.status.borrow().loaded;
        if !loaded {
            let doc = seed_document(OffsetDateTime::now_utc());
            self.inner
                .state
                .send_replace(Arc::new(MeterState::from_document(doc)));
        }

        self.inner.status.send_modify(|s| {
            s.loaded = true;
            s.last_error = Some(err);
        });
    }
}

async fn write_loop(
    repository: Arc<dyn DocumentRepository>,
    mut rx: mpsc::UnboundedReceiver<QueuedWrite>,
    status: Arc<watch::Sender<StoreStatus>>,
    written: Arc<watch::Sender<u64>>,
    pending: PendingWrites,
) {
    while let Some(QueuedWrite { fingerprint, document }) = rx.recv().await {
        match repository.replace_all(&document).await {
            Ok(()) => {
                metrics::counter!("store_persisted_documents_total").increment(1);
                status.send_if_modified(|s| {
                    if matches!(s.last_error, Some(RepositoryError::Persistence(_))) {
                        s.last_error = None;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                // No retry: the next mutation writes the full state again.
                tracing::error!(error = %e, "failed to persist meter document");
                metrics::counter!("store_persist_errors_total").increment(1);
                status.send_modify(|s| s.last_error = Some(e));

                // A failed write never comes back as a snapshot.
                let mut pending = lock_pending(&pending);
                if let Some(idx) = pending.iter().position(|f| *f == fingerprint) {
                    pending.remove(idx);
                }
            }
        }
        written.send_modify(|n| *n += 1);
    }

    tracing::debug!("document writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use meter_client::domain::seed::seed_document;
    use time::macros::datetime;

    fn store_with_seed() -> (MeterStore, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let store = MeterStore::new(repo.clone());
        store.apply_remote(seed_document(datetime!(2024-01-01 00:00:00 UTC)));
        (store, repo)
    }

    #[tokio::test]
    async fn mutation_updates_local_state_and_writes_whole_document() {
        let (store, repo) = store_with_seed();

        let state = store.add_reading("m1", 42.0).unwrap();
        assert_eq!(state.meter("m1").unwrap().latest_reading, 42.0);
        assert_eq!(store.meter("m1").unwrap().history.len(), 1);

        repo.wait_for_write_attempts(1).await;
        let written = repo.document().unwrap();
        assert_eq!(written.meters.len(), 8);
        assert_eq!(written.meter("m1").unwrap().latest_reading, 42.0);
    }

    #[tokio::test]
    async fn failed_mutation_neither_commits_nor_writes() {
        let (store, repo) = store_with_seed();
        let before = store.snapshot();

        assert!(store.delete_family("A").is_err());
        assert_eq!(*store.snapshot(), *before);

        // A later successful write is the first one the repository sees.
        store.add_family("C", "teal").unwrap();
        repo.wait_for_write_attempts(1).await;
        assert_eq!(repo.write_attempts(), 1);
        assert!(repo.document().unwrap().families.contains(&"C".to_string()));
    }

    #[tokio::test]
    async fn mutation_before_load_neither_commits_nor_writes() {
        let repo = Arc::new(InMemoryRepository::with_document(seed_document(datetime!(2024-01-01 00:00:00 UTC))));
        let store = MeterStore::new(repo.clone());

        assert_eq!(store.add_family("C", "teal").unwrap_err(), StoreError::NotLoaded);
        assert_eq!(store.add_reading("m1", 5.0).unwrap_err(), StoreError::NotLoaded);
        store.flush().await;

        assert!(store.snapshot().families.is_empty());
        assert_eq!(repo.write_attempts(), 0);
        assert_eq!(repo.document().unwrap().meters.len(), 8);
    }

    #[tokio::test]
    async fn stale_echo_of_own_write_is_ignored() {
        let (store, repo) = store_with_seed();

        store.add_reading("m1", 10.0).unwrap();
        let first = store.snapshot().to_document(OffsetDateTime::now_utc());
        store.add_reading("m1", 20.0).unwrap();

        assert!(!store.apply_remote(first));
        let m1 = store.meter("m1").unwrap();
        assert_eq!(m1.latest_reading, 20.0);
        assert_eq!(m1.history.len(), 2);

        store.add_reading("m1", 30.0).unwrap();
        store.flush().await;
        let written = repo.document().unwrap();
        assert_eq!(written.meter("m1").unwrap().history.len(), 3);
        assert_eq!(written.meter("m1").unwrap().latest_reading, 30.0);
    }

    #[tokio::test]
    async fn other_writers_still_replace_state_while_writes_are_pending() {
        let (store, _repo) = store_with_seed();
        store.add_reading("m1", 10.0).unwrap();

        let mut foreign = seed_document(datetime!(2024-02-01 00:00:00 UTC));
        foreign.meters.retain(|m| m.id != "m8");
        assert!(store.apply_remote(foreign));
        assert!(store.meter("m8").is_none());
        assert!(store.meter("m1").unwrap().history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn own_echoes_never_undo_later_readings() {
        let repo = Arc::new(InMemoryRepository::with_document(seed_document(datetime!(2024-01-01 00:00:00 UTC))));
        let store = MeterStore::new(repo.clone());
        tokio::spawn(run_sync(store.clone()));
        store.wait_until_loaded().await;

        for v in 1..=50 {
            store.add_reading("m1", f64::from(v)).unwrap();
            tokio::task::yield_now().await;
        }
        store.flush().await;

        let written = repo.document().unwrap();
        let m1 = written.meter("m1").unwrap();
        assert_eq!(m1.history.len(), 50);
        assert_eq!(m1.latest_reading, 50.0);
    }

    #[tokio::test]
    async fn no_op_mutation_skips_the_write() {
        let (store, repo) = store_with_seed();
        store.add_family("A", "rose").unwrap();
        store.add_family("C", "teal").unwrap();

        repo.wait_for_write_attempts(1).await;
        assert_eq!(repo.write_attempts(), 1);
        assert_eq!(
            store.snapshot().family_themes.get("A").map(String::as_str),
            Some("indigo")
        );
    }

    #[tokio::test]
    async fn persistence_failure_keeps_local_state_and_is_reported() {
        let (store, repo) = store_with_seed();
        repo.set_fail_writes(true);

        store.add_reading("m2", 7.0).unwrap();
        repo.wait_for_write_attempts(1).await;

        let mut status = store.inner.status.subscribe();
        let _ = status.wait_for(|s| s.last_error.is_some()).await;
        assert!(matches!(store.status().last_error, Some(RepositoryError::Persistence(_))));
        assert_eq!(store.meter("m2").unwrap().latest_reading, 7.0);

        // The next successful write clears the indicator.
        repo.set_fail_writes(false);
        store.add_reading("m2", 8.0).unwrap();
        let _ = status.wait_for(|s| s.last_error.is_none()).await;
        assert_eq!(repo.document().unwrap().meter("m2").unwrap().latest_reading, 8.0);
    }

    #[tokio::test]
    async fn flush_waits_for_queued_writes() {
        let (store, repo) = store_with_seed();
        for v in [1.0, 2.0, 3.0] {
            store.add_reading("m3", v).unwrap();
        }

        store.flush().await;

        assert_eq!(repo.write_attempts(), 3);
        assert_eq!(repo.document().unwrap().meter("m3").unwrap().latest_reading, 3.0);
    }

    #[tokio::test]
    async fn identical_remote_snapshot_is_ignored() {
        let (store, _repo) = store_with_seed();
        let doc = store.snapshot().to_document(OffsetDateTime::now_utc());

        assert!(!store.apply_remote(doc.clone()));

        let mut changed = doc;
        changed.meters.retain(|m| m.id != "m8");
        assert!(store.apply_remote(changed));
        assert!(store.meter("m8").is_none());
    }

    #[tokio::test]
    async fn sync_error_before_load_falls_back_to_defaults() {
        let repo = Arc::new(InMemoryRepository::new());
        let store = MeterStore::new(repo.clone());
        assert!(!store.status().loaded);

        store.record_sync_error(RepositoryError::PermissionDenied("rules".to_string()));

        let status = store.status();
        assert!(status.loaded);
        assert!(matches!(status.last_error, Some(RepositoryError::PermissionDenied(_))));
        assert_eq!(store.snapshot().meters.len(), 8);
        assert_eq!(repo.write_attempts(), 0);
    }

    #[tokio::test]
    async fn sync_error_after_load_keeps_state() {
        let (store, _repo) = store_with_seed();
        store.delete_meter("m8").unwrap();

        store.record_sync_error(RepositoryError::Sync("connection reset".to_string()));

        assert!(store.meter("m8").is_none());
        assert_eq!(store.snapshot().meters.len(), 7);
    }
}
