//! Local entity store abstraction.

use crate::error::{SyncError, SyncResult};
use deltasync_protocol::{DeltaRecord, OperationType, StoreSnapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// The host application's entity store, as seen by the sync engine.
///
/// Remote deltas are applied between `begin_batch` and `end_batch`. Apply
/// operations must be idempotent: the same delta applied twice leaves the
/// same state as applying it once.
pub trait EntityStore: Send + Sync {
    /// Starts a batch. Changes inside a batch become visible at `end_batch`.
    fn begin_batch(&self);

    /// Commits the current batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be committed.
    fn end_batch(&self) -> SyncResult<()>;

    /// Applies a create delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be applied.
    fn apply_create(&self, delta: &DeltaRecord) -> SyncResult<()>;

    /// Applies an update delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be applied.
    fn apply_update(&self, delta: &DeltaRecord) -> SyncResult<()>;

    /// Applies a delete delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be applied.
    fn apply_delete(&self, delta: &DeltaRecord) -> SyncResult<()>;

    /// Applies a move delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be applied.
    fn apply_move(&self, delta: &DeltaRecord) -> SyncResult<()>;

    /// Returns the full local state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    fn snapshot(&self) -> SyncResult<StoreSnapshot>;

    /// Replaces the full local state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be replaced.
    fn replace_all(&self, snapshot: StoreSnapshot) -> SyncResult<()>;

    /// Dispatches a delta to the matching apply operation.
    ///
    /// # Errors
    ///
    /// Returns whatever the apply operation returns.
    fn apply(&self, delta: &DeltaRecord) -> SyncResult<()> {
        match delta.operation() {
            OperationType::Create => self.apply_create(delta),
            OperationType::Update => self.apply_update(delta),
            OperationType::Delete => self.apply_delete(delta),
            OperationType::Move => self.apply_move(delta),
        }
    }
}

/// An in-memory entity store for testing.
///
/// Batches are staged on a copy of the state and swapped in at
/// `end_batch`. Deltas for chosen entity ids can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    visible: RwLock<StoreSnapshot>,
    staged: Mutex<Option<StoreSnapshot>>,
    failing: Mutex<HashSet<String>>,
    batches_committed: AtomicU64,
    applied: AtomicU64,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `snapshot`.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            visible: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Makes every delta for `entity_id` fail to apply.
    pub fn fail_on(&self, entity_id: impl Into<String>) {
        self.failing.lock().insert(entity_id.into());
    }

    /// Returns the number of committed batches.
    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::SeqCst)
    }

    /// Returns the number of deltas applied successfully.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Applies a local change directly, as the host application would.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be applied.
    pub fn apply_local(&self, delta: &DeltaRecord) -> SyncResult<()> {
        self.visible
            .write()
            .apply_delta(delta)
            .map_err(|e| apply_error(delta, e))
    }

    fn apply_delta(&self, delta: &DeltaRecord) -> SyncResult<()> {
        if self.failing.lock().contains(delta.entity_id()) {
            return Err(SyncError::Apply {
                entity: delta.entity_key().to_string(),
                reason: "rejected by store".into(),
            });
        }

        let mut staged = self.staged.lock();
        let result = match staged.as_mut() {
            Some(snapshot) => snapshot.apply_delta(delta),
            None => self.visible.write().apply_delta(delta),
        };
        result.map_err(|e| apply_error(delta, e))?;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn apply_error(delta: &DeltaRecord, error: impl std::fmt::Display) -> SyncError {
    SyncError::Apply {
        entity: delta.entity_key().to_string(),
        reason: error.to_string(),
    }
}

impl EntityStore for MemoryEntityStore {
    fn begin_batch(&self) {
        let mut staged = self.staged.lock();
        if staged.is_none() {
            *staged = Some(self.visible.read().clone());
        }
    }

    fn end_batch(&self) -> SyncResult<()> {
        if let Some(snapshot) = self.staged.lock().take() {
            *self.visible.write() = snapshot;
            self.batches_committed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn apply_create(&self, delta: &DeltaRecord) -> SyncResult<()> {
        self.apply_delta(delta)
    }

    fn apply_update(&self, delta: &DeltaRecord) -> SyncResult<()> {
        self.apply_delta(delta)
    }

    fn apply_delete(&self, delta: &DeltaRecord) -> SyncResult<()> {
        self.apply_delta(delta)
    }

    fn apply_move(&self, delta: &DeltaRecord) -> SyncResult<()> {
        self.apply_delta(delta)
    }

    fn snapshot(&self) -> SyncResult<StoreSnapshot> {
        Ok(self.visible.read().clone())
    }

    fn replace_all(&self, snapshot: StoreSnapshot) -> SyncResult<()> {
        let mut staged = self.staged.lock();
        match staged.as_mut() {
            Some(current) => *current = snapshot,
            None => *self.visible.write() = snapshot,
        }
        Ok(())
    }
}
