//! Persistence traits consumed by the sync engine.

use crate::error::StorageResult;
use deltasync_protocol::{
    ConflictId, ConflictInfo, DeltaId, DeltaRecord, DeviceId, QueueItem, QueueItemId,
    SyncVersionState,
};
use std::collections::HashMap;

/// Append-only store of locally committed deltas.
///
/// # Invariants
///
/// - `bulk_append` persists either every record or none of them
/// - `query_ordered_since` returns records in ascending version order
/// - `latest_version` never decreases, even when pruning removes records
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait DeltaStore: Send + Sync {
    /// Appends a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be persisted.
    fn append(&self, delta: &DeltaRecord) -> StorageResult<()> {
        self.bulk_append(std::slice::from_ref(delta))
    }

    /// Appends records in one write.
    ///
    /// # Errors
    ///
    /// Returns an error if the records could not be persisted. Nothing is
    /// persisted in that case.
    fn bulk_append(&self, deltas: &[DeltaRecord]) -> StorageResult<()>;

    /// Returns every record with `version > since`, ascending by version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn query_ordered_since(&self, since: u64) -> StorageResult<Vec<DeltaRecord>>;

    /// Returns the highest version ever appended, or 0 for an empty store.
    ///
    /// Pruning never lowers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn latest_version(&self) -> StorageResult<u64>;

    /// Returns the number of persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn delta_count(&self) -> StorageResult<usize>;

    /// Removes records with a timestamp strictly older than `cutoff_millis`.
    ///
    /// Returns the number of removed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be rewritten.
    fn prune_older_than(&self, cutoff_millis: u64) -> StorageResult<usize>;
}

/// Durable FIFO backing the offline delivery queue.
pub trait QueueStore: Send + Sync {
    /// Loads every item in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load_queue(&self) -> StorageResult<Vec<QueueItem>>;

    /// Inserts an item at the tail, or replaces it in place if the id exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the item could not be persisted.
    fn put_item(&self, item: &QueueItem) -> StorageResult<()>;

    /// Removes an item. Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be updated.
    fn remove_item(&self, id: QueueItemId) -> StorageResult<()>;

    /// Removes every item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be updated.
    fn clear_queue(&self) -> StorageResult<()>;
}

/// Watermarks and the applied-delta ledger.
pub trait SyncStateStore: Send + Sync {
    /// Loads the version state for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state is unreadable.
    fn load_version_state(&self, device_id: DeviceId) -> StorageResult<Option<SyncVersionState>>;

    /// Returns every stored version state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn version_states(&self) -> StorageResult<Vec<SyncVersionState>>;

    /// Saves the version state for `state.device_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state could not be persisted.
    fn save_version_state(&self, state: &SyncVersionState) -> StorageResult<()>;

    /// Deletes the version state for a device, forcing a full sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be updated.
    fn clear_version_state(&self, device_id: DeviceId) -> StorageResult<()>;

    /// Returns true if a remote delta has already been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn is_applied(&self, id: DeltaId) -> StorageResult<bool>;

    /// Records remote deltas as applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger could not be persisted.
    fn mark_applied(&self, ids: &[DeltaId]) -> StorageResult<()>;

    /// Returns the number of ids in the applied ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn applied_count(&self) -> StorageResult<usize>;
}

/// Append-only history of conflict records.
///
/// A conflict may appear several times: once when recorded unresolved and
/// again when resolved. The latest entry per id is authoritative.
pub trait ConflictHistoryStore: Send + Sync {
    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    fn append_conflict(&self, conflict: &ConflictInfo) -> StorageResult<()>;

    /// Returns every entry in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn conflict_history(&self) -> StorageResult<Vec<ConflictInfo>>;

    /// Returns conflicts whose latest entry is unresolved, in first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn unresolved_conflicts(&self) -> StorageResult<Vec<ConflictInfo>> {
        let history = self.conflict_history()?;
        let mut order: Vec<ConflictId> = Vec::new();
        let mut latest: HashMap<ConflictId, ConflictInfo> = HashMap::new();
        for entry in history {
            if !latest.contains_key(&entry.id) {
                order.push(entry.id);
            }
            latest.insert(entry.id, entry);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .filter(|c| !c.resolved)
            .collect())
    }
}
