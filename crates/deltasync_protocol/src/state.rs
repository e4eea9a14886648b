//! Per-device sync watermarks.

use crate::ids::DeviceId;
use serde::{Deserialize, Serialize};

/// Watermarks recorded after each successful sync cycle.
///
/// `local_version` is the highest local delta version that has been pushed
/// or handed to the offline queue. `remote_version` is the remote watermark
/// observed when the cycle started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVersionState {
    /// Highest local version incorporated into the remote.
    pub local_version: u64,
    /// Remote watermark at the last sync.
    pub remote_version: u64,
    /// Completion time of the last sync, in milliseconds.
    pub last_sync_time: u64,
    /// Device these watermarks belong to.
    pub device_id: DeviceId,
    /// Deltas still waiting in the offline queue.
    pub pending_changes: u64,
}

impl SyncVersionState {
    /// Creates the initial (never synced) state for a device.
    pub fn initial(device_id: DeviceId) -> Self {
        Self {
            local_version: 0,
            remote_version: 0,
            last_sync_time: 0,
            device_id,
            pending_changes: 0,
        }
    }

    /// Returns true if this state forces a full reconciliation.
    pub fn requires_full_sync(&self) -> bool {
        self.local_version == 0
    }
}
