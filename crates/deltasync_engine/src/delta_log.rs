//! Versioned log of local changes.

use crate::config::DeltaLogConfig;
use crate::device::DeviceIdentity;
use crate::error::SyncResult;
use deltasync_protocol::{
    now_millis, DeltaRecord, DeviceId, EntityChanges, OperationType, ProtocolError,
};
use deltasync_storage::DeltaStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_FLUSH_RETRY: Duration = Duration::from_millis(100);
const MAX_FLUSH_RETRY: Duration = Duration::from_secs(30);

/// Statistics about the delta log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaLogStats {
    /// Device that authors this log's records.
    pub device_id: DeviceId,
    /// Highest assigned version.
    pub current_version: u64,
    /// Records in the store.
    pub persisted: usize,
    /// Records waiting in the write buffer.
    pub buffered: usize,
    /// Whether the version could not be loaded at startup.
    pub needs_full_resync: bool,
}

/// Records every local mutation as a versioned delta.
///
/// Versions are assigned under a lock, so they are strictly increasing and
/// gap-free for the life of the process. Non-immediate changes are buffered
/// and flushed together after `batch_delay`; a failed timer flush keeps the
/// buffer and retries with doubling delays, and buffered records remain
/// visible to [`DeltaLog::get_since`].
///
/// Cloning is cheap and clones share the same log.
#[derive(Clone)]
pub struct DeltaLog {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DeltaStore>,
    device_id: DeviceId,
    config: DeltaLogConfig,
    writer: Mutex<WriterState>,
    needs_full_resync: AtomicBool,
    flush_scheduled: AtomicBool,
    shutdown: CancellationToken,
}

struct WriterState {
    current_version: u64,
    buffer: Vec<DeltaRecord>,
}

impl DeltaLog {
    /// Opens the log, resuming from the highest persisted version.
    ///
    /// If the version cannot be read the log starts over at 0 and reports
    /// that a full resync is needed.
    pub fn open(
        store: Arc<dyn DeltaStore>,
        identity: &dyn DeviceIdentity,
        config: DeltaLogConfig,
    ) -> Self {
        let device_id = identity.device_id();
        let (current_version, needs_full_resync) = match store.latest_version() {
            Ok(version) => (version, false),
            Err(e) => {
                warn!(error = %e, "failed to load delta log version; starting at 0");
                (0, true)
            }
        };
        info!(%device_id, current_version, "delta log opened");

        Self {
            inner: Arc::new(Inner {
                store,
                device_id,
                config,
                writer: Mutex::new(WriterState {
                    current_version,
                    buffer: Vec::new(),
                }),
                needs_full_resync: AtomicBool::new(needs_full_resync),
                flush_scheduled: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the authoring device.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Returns the highest assigned version.
    pub fn current_version(&self) -> u64 {
        self.inner.writer.lock().current_version
    }

    /// Raises the version counter to at least `version`.
    ///
    /// Called with the last committed sync watermark so that versions the
    /// remote has already seen are never assigned again. Returns true if
    /// the counter moved.
    pub fn advance_to(&self, version: u64) -> bool {
        let mut writer = self.inner.writer.lock();
        if version <= writer.current_version {
            return false;
        }
        warn!(
            from = writer.current_version,
            to = version,
            "delta log behind sync watermark; skipping ahead"
        );
        writer.current_version = version;
        true
    }

    /// Returns true if the log could not resume its version.
    pub fn needs_full_resync(&self) -> bool {
        self.inner.needs_full_resync.load(Ordering::SeqCst)
    }

    /// Clears the resync flag after a full reconciliation.
    pub fn clear_full_resync(&self) {
        self.inner.needs_full_resync.store(false, Ordering::SeqCst);
    }

    /// Returns the number of records waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.inner.writer.lock().buffer.len()
    }

    /// Records a local change and returns the committed record.
    ///
    /// With `immediate` the record (and anything already buffered) is
    /// written before returning; otherwise it is written by the next batch
    /// flush. A failed write never loses the record: it stays buffered.
    ///
    /// # Errors
    ///
    /// Returns an error only for invalid input (empty entity id).
    pub fn track_change(
        &self,
        operation: OperationType,
        entity_id: impl Into<String>,
        changes: EntityChanges,
        immediate: bool,
    ) -> SyncResult<DeltaRecord> {
        let entity_id = entity_id.into();
        if entity_id.is_empty() {
            return Err(ProtocolError::EmptyEntityId.into());
        }

        let mut writer = self.inner.writer.lock();
        let version = writer.current_version + 1;
        let record = DeltaRecord::new(version, self.inner.device_id, operation, entity_id, changes)?;
        writer.current_version = version;
        writer.buffer.push(record.clone());
        debug!(
            version,
            entity = %record.entity_key(),
            operation = record.operation().as_str(),
            "tracked change"
        );

        if immediate {
            match self.inner.store.bulk_append(&writer.buffer) {
                Ok(()) => {
                    writer.buffer.clear();
                    return Ok(record);
                }
                Err(e) => {
                    warn!(version, error = %e, "immediate write failed; record stays buffered");
                }
            }
        }
        drop(writer);

        self.inner.schedule_flush();
        Ok(record)
    }

    /// Writes every buffered record now.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns the store error; the buffer is kept intact.
    pub fn flush(&self) -> SyncResult<usize> {
        self.inner.flush()
    }

    /// Returns every record with `version > since`, persisted or buffered,
    /// ascending by version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn get_since(&self, since: u64) -> SyncResult<Vec<DeltaRecord>> {
        let writer = self.inner.writer.lock();
        let mut records = self.inner.store.query_ordered_since(since)?;
        records.extend(
            writer
                .buffer
                .iter()
                .filter(|d| d.version() > since)
                .cloned(),
        );
        records.sort_by_key(|d| d.version());
        records.dedup_by_key(|d| d.version());
        Ok(records)
    }

    /// Removes records older than the configured retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be pruned.
    pub fn prune(&self) -> SyncResult<usize> {
        self.prune_older_than(self.inner.config.retention)
    }

    /// Removes records older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be pruned.
    pub fn prune_older_than(&self, max_age: Duration) -> SyncResult<usize> {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let removed = self.inner.store.prune_older_than(cutoff)?;
        info!(removed, cutoff, "pruned delta log");
        Ok(removed)
    }

    /// Returns log statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> SyncResult<DeltaLogStats> {
        let writer = self.inner.writer.lock();
        Ok(DeltaLogStats {
            device_id: self.inner.device_id,
            current_version: writer.current_version,
            persisted: self.inner.store.delta_count()?,
            buffered: writer.buffer.len(),
            needs_full_resync: self.needs_full_resync(),
        })
    }

    /// Stops the flush timer and writes whatever is buffered.
    ///
    /// # Errors
    ///
    /// Returns the store error if the final flush fails.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.inner.shutdown.cancel();
        self.inner.flush().map(|_| ())
    }
}

impl Inner {
    fn flush(&self) -> SyncResult<usize> {
        let mut writer = self.writer.lock();
        if writer.buffer.is_empty() {
            return Ok(0);
        }
        match self.store.bulk_append(&writer.buffer) {
            Ok(()) => {
                let count = writer.buffer.len();
                writer.buffer.clear();
                debug!(count, "flushed delta buffer");
                Ok(count)
            }
            Err(e) => {
                warn!(pending = writer.buffer.len(), error = %e, "delta flush failed; keeping buffer");
                Err(e.into())
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            let _ = self.flush();
            return;
        }
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    let mut delay = inner.config.batch_delay;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = inner.shutdown.cancelled() => {}
                        }
                        inner.flush_scheduled.store(false, Ordering::SeqCst);
                        if inner.flush().is_ok() || inner.shutdown.is_cancelled() {
                            break;
                        }
                        // A newer timer already owns the retry.
                        if inner.flush_scheduled.swap(true, Ordering::SeqCst) {
                            break;
                        }
                        delay = (delay * 2).clamp(MIN_FLUSH_RETRY, MAX_FLUSH_RETRY);
                        debug!(?delay, "retrying delta flush");
                    }
                });
            }
            Err(_) => {
                self.flush_scheduled.store(false, Ordering::SeqCst);
                let _ = self.flush();
            }
        }
    }
}

impl std::fmt::Debug for DeltaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaLog")
            .field("device_id", &self.inner.device_id)
            .field("current_version", &self.current_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDeviceIdentity;
    use deltasync_protocol::{GroupField, FieldChange};
    use deltasync_storage::MemoryStore;

    fn rename(name: &str) -> EntityChanges {
        EntityChanges::Group(vec![FieldChange::set(GroupField::Name, name)])
    }

    fn open(store: &Arc<MemoryStore>) -> DeltaLog {
        DeltaLog::open(
            store.clone(),
            &StaticDeviceIdentity::random(),
            DeltaLogConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn versions_are_sequential() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        for expected in 1..=5 {
            let record = log
                .track_change(OperationType::Update, "g1", rename("x"), false)
                .unwrap();
            assert_eq!(record.version(), expected);
        }
        assert_eq!(log.current_version(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_persisted_version() {
        let store = Arc::new(MemoryStore::new());
        {
            let log = open(&store);
            log.track_change(OperationType::Create, "g1", rename("a"), true)
                .unwrap();
            log.track_change(OperationType::Update, "g1", rename("b"), true)
                .unwrap();
        }
        let log = open(&store);
        assert_eq!(log.current_version(), 2);
        let next = log
            .track_change(OperationType::Update, "g1", rename("c"), true)
            .unwrap();
        assert_eq!(next.version(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_version_forces_full_resync() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let log = open(&store);
        assert_eq!(log.current_version(), 0);
        assert!(log.needs_full_resync());
        log.clear_full_resync();
        assert!(!log.needs_full_resync());
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_changes_flush_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        log.track_change(OperationType::Update, "g1", rename("a"), false)
            .unwrap();
        log.track_change(OperationType::Update, "g1", rename("b"), false)
            .unwrap();
        assert_eq!(store.delta_count().unwrap(), 0);
        assert_eq!(log.pending_len(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.delta_count().unwrap(), 2);
        assert_eq!(log.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_timer_flush_retries_without_new_changes() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        store.set_fail_writes(true);
        log.track_change(OperationType::Update, "g1", rename("a"), false)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(log.pending_len(), 1);

        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(log.pending_len(), 0);
        assert_eq!(store.delta_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn advance_to_skips_versions_already_synced() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        assert!(log.advance_to(3));
        assert!(!log.advance_to(2));
        let record = log
            .track_change(OperationType::Update, "g1", rename("a"), true)
            .unwrap();
        assert_eq!(record.version(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn pruned_log_never_reuses_versions() {
        let store = Arc::new(MemoryStore::new());
        {
            let log = open(&store);
            for name in ["a", "b", "c"] {
                log.track_change(OperationType::Update, "g1", rename(name), true)
                    .unwrap();
            }
            assert_eq!(store.prune_older_than(u64::MAX).unwrap(), 3);
        }

        let log = open(&store);
        assert_eq!(log.current_version(), 3);
        let next = log
            .track_change(OperationType::Update, "g1", rename("d"), true)
            .unwrap();
        assert_eq!(next.version(), 4);
        assert_eq!(log.get_since(3).unwrap(), vec![next]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_records() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        store.set_fail_writes(true);

        let record = log
            .track_change(OperationType::Update, "g1", rename("a"), true)
            .unwrap();
        assert_eq!(log.pending_len(), 1);
        assert!(log.flush().is_err());

        let visible = log.get_since(0).unwrap();
        assert_eq!(visible, vec![record]);

        store.set_fail_writes(false);
        assert_eq!(log.flush().unwrap(), 1);
        assert_eq!(store.delta_count().unwrap(), 1);
        assert_eq!(log.get_since(0).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_since_merges_store_and_buffer() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        log.track_change(OperationType::Create, "g1", rename("a"), true)
            .unwrap();
        log.track_change(OperationType::Update, "g1", rename("b"), false)
            .unwrap();
        log.track_change(OperationType::Update, "g1", rename("c"), false)
            .unwrap();

        let versions: Vec<u64> = log
            .get_since(1)
            .unwrap()
            .iter()
            .map(DeltaRecord::version)
            .collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_entity_id_is_rejected_without_consuming_a_version() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        assert!(log
            .track_change(OperationType::Update, "", rename("a"), true)
            .is_err());
        assert_eq!(log.current_version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_buffer() {
        let store = Arc::new(MemoryStore::new());
        let log = open(&store);
        log.track_change(OperationType::Update, "g1", rename("a"), false)
            .unwrap();
        log.shutdown().unwrap();
        assert_eq!(store.delta_count().unwrap(), 1);

        // After shutdown, writes go straight through.
        log.track_change(OperationType::Update, "g1", rename("b"), false)
            .unwrap();
        assert_eq!(store.delta_count().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_old_records() {
        let store = Arc::new(MemoryStore::new());
        let old = DeltaRecord::new(
            1,
            deltasync_protocol::DeviceId::new(),
            OperationType::Update,
            "g1",
            rename("old"),
        )
        .unwrap()
        .with_timestamp(1_000);
        store.append(&old).unwrap();

        let log = open(&store);
        log.track_change(OperationType::Update, "g1", rename("new"), true)
            .unwrap();
        assert_eq!(log.prune().unwrap(), 1);
        let stats = log.stats().unwrap();
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.current_version, 2);
    }
}
