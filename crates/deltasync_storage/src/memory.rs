//! In-memory store for testing.

use crate::backend::{ConflictHistoryStore, DeltaStore, QueueStore, SyncStateStore};
use crate::error::{StorageError, StorageResult};
use deltasync_protocol::{
    ConflictInfo, DeltaId, DeltaRecord, DeviceId, QueueItem, QueueItemId, SyncVersionState,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory implementation of every store trait.
///
/// This store keeps all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sync sessions that don't need persistence
///
/// Reads and writes can be made to fail on demand to exercise error paths.
///
/// # Example
///
/// ```rust
/// use deltasync_storage::{DeltaStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// assert_eq!(store.latest_version().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    deltas: RwLock<Vec<DeltaRecord>>,
    high_water: AtomicU64,
    queue: RwLock<Vec<QueueItem>>,
    states: RwLock<HashMap<DeviceId, SyncVersionState>>,
    applied: RwLock<HashSet<DeltaId>>,
    conflicts: RwLock<Vec<ConflictInfo>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl DeltaStore for MemoryStore {
    fn bulk_append(&self, deltas: &[DeltaRecord]) -> StorageResult<()> {
        self.check_write()?;
        self.deltas.write().extend_from_slice(deltas);
        if let Some(max) = deltas.iter().map(DeltaRecord::version).max() {
            self.high_water.fetch_max(max, Ordering::SeqCst);
        }
        Ok(())
    }

    fn query_ordered_since(&self, since: u64) -> StorageResult<Vec<DeltaRecord>> {
        self.check_read()?;
        let mut result: Vec<DeltaRecord> = self
            .deltas
            .read()
            .iter()
            .filter(|d| d.version() > since)
            .cloned()
            .collect();
        result.sort_by_key(|d| d.version());
        Ok(result)
    }

    fn latest_version(&self) -> StorageResult<u64> {
        self.check_read()?;
        Ok(self.high_water.load(Ordering::SeqCst))
    }

    fn delta_count(&self) -> StorageResult<usize> {
        self.check_read()?;
        Ok(self.deltas.read().len())
    }

    fn prune_older_than(&self, cutoff_millis: u64) -> StorageResult<usize> {
        self.check_write()?;
        let mut deltas = self.deltas.write();
        let before = deltas.len();
        deltas.retain(|d| d.timestamp() >= cutoff_millis);
        Ok(before - deltas.len())
    }
}

impl QueueStore for MemoryStore {
    fn load_queue(&self) -> StorageResult<Vec<QueueItem>> {
        self.check_read()?;
        Ok(self.queue.read().clone())
    }

    fn put_item(&self, item: &QueueItem) -> StorageResult<()> {
        self.check_write()?;
        let mut queue = self.queue.write();
        match queue.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => queue.push(item.clone()),
        }
        Ok(())
    }

    fn remove_item(&self, id: QueueItemId) -> StorageResult<()> {
        self.check_write()?;
        self.queue.write().retain(|item| item.id != id);
        Ok(())
    }

    fn clear_queue(&self) -> StorageResult<()> {
        self.check_write()?;
        self.queue.write().clear();
        Ok(())
    }
}

impl SyncStateStore for MemoryStore {
    fn load_version_state(&self, device_id: DeviceId) -> StorageResult<Option<SyncVersionState>> {
        self.check_read()?;
        Ok(self.states.read().get(&device_id).cloned())
    }

    fn version_states(&self) -> StorageResult<Vec<SyncVersionState>> {
        self.check_read()?;
        Ok(self.states.read().values().cloned().collect())
    }

    fn save_version_state(&self, state: &SyncVersionState) -> StorageResult<()> {
        self.check_write()?;
        self.states.write().insert(state.device_id, state.clone());
        Ok(())
    }

    fn clear_version_state(&self, device_id: DeviceId) -> StorageResult<()> {
        self.check_write()?;
        self.states.write().remove(&device_id);
        Ok(())
    }

    fn is_applied(&self, id: DeltaId) -> StorageResult<bool> {
        self.check_read()?;
        Ok(self.applied.read().contains(&id))
    }

    fn mark_applied(&self, ids: &[DeltaId]) -> StorageResult<()> {
        self.check_write()?;
        self.applied.write().extend(ids.iter().copied());
        Ok(())
    }

    fn applied_count(&self) -> StorageResult<usize> {
        self.check_read()?;
        Ok(self.applied.read().len())
    }
}

impl ConflictHistoryStore for MemoryStore {
    fn append_conflict(&self, conflict: &ConflictInfo) -> StorageResult<()> {
        self.check_write()?;
        self.conflicts.write().push(conflict.clone());
        Ok(())
    }

    fn conflict_history(&self) -> StorageResult<Vec<ConflictInfo>> {
        self.check_read()?;
        Ok(self.conflicts.read().clone())
    }
}
