//! Remote provider abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use deltasync_protocol::{DeltaRecord, StoreSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// The remote side of synchronization.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, cloud storage, in-memory for testing, etc.).
/// Versions are the remote's own monotonically increasing watermark.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Returns the current remote watermark.
    async fn remote_version(&self) -> SyncResult<u64>;

    /// Returns every delta the remote accepted after `version`, in order.
    async fn deltas_since(&self, version: u64) -> SyncResult<Vec<DeltaRecord>>;

    /// Uploads deltas. Either all are accepted or the call fails.
    async fn push_deltas(&self, deltas: &[DeltaRecord]) -> SyncResult<()>;

    /// Downloads the full remote state, if the remote has one.
    async fn pull_snapshot(&self) -> SyncResult<Option<StoreSnapshot>>;

    /// Replaces the full remote state.
    async fn push_snapshot(&self, snapshot: &StoreSnapshot) -> SyncResult<()>;
}

#[derive(Debug, Default)]
struct RemoteState {
    log: Vec<DeltaRecord>,
    snapshot: Option<StoreSnapshot>,
    online: bool,
    failing_pushes: u32,
    push_calls: u64,
}

/// An in-memory remote for testing.
///
/// Clones share state, so several engines can sync against one remote.
/// The watermark is the number of accepted deltas; pushed deltas are also
/// folded into the snapshot.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote with no snapshot.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                online: true,
                ..RemoteState::default()
            })),
        }
    }

    /// Creates a remote seeded with a snapshot.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        let remote = Self::new();
        remote.state.lock().snapshot = Some(snapshot);
        remote
    }

    /// Makes every call fail (or succeed again).
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Makes the next `count` pushes fail with a retryable error.
    pub fn fail_next_pushes(&self, count: u32) {
        self.state.lock().failing_pushes = count;
    }

    /// Returns the number of push attempts, failed ones included.
    pub fn push_calls(&self) -> u64 {
        self.state.lock().push_calls
    }

    /// Returns every accepted delta.
    pub fn accepted(&self) -> Vec<DeltaRecord> {
        self.state.lock().log.clone()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Option<StoreSnapshot> {
        self.state.lock().snapshot.clone()
    }

    fn check_online(state: &RemoteState) -> SyncResult<()> {
        if state.online {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("remote unreachable"))
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteProvider for MemoryRemote {
    async fn remote_version(&self) -> SyncResult<u64> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        Ok(state.log.len() as u64)
    }

    async fn deltas_since(&self, version: u64) -> SyncResult<Vec<DeltaRecord>> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        let start = usize::try_from(version).unwrap_or(usize::MAX).min(state.log.len());
        Ok(state.log[start..].to_vec())
    }

    async fn push_deltas(&self, deltas: &[DeltaRecord]) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.push_calls += 1;
        Self::check_online(&state)?;
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(SyncError::transport_retryable("push rejected"));
        }

        let snapshot = state.snapshot.get_or_insert_with(StoreSnapshot::default);
        for delta in deltas {
            if let Err(e) = snapshot.apply_delta(delta) {
                warn!(delta_id = %delta.id(), error = %e, "remote snapshot skipped delta");
            }
        }
        state.log.extend_from_slice(deltas);
        Ok(())
    }

    async fn pull_snapshot(&self) -> SyncResult<Option<StoreSnapshot>> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        Ok(state.snapshot.clone())
    }

    async fn push_snapshot(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
