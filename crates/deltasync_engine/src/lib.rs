//! # DeltaSync Engine
//!
//! Incremental delta synchronization between a local entity store and a
//! remote.
//!
//! This crate provides:
//! - `DeltaLog`: versioned, batched recording of local changes
//! - `UpdateScheduler`: priority tiers and merge-window coalescing of UI updates
//! - `ConflictResolver`: detection, automatic and manual resolution, history
//! - `OfflineDeliveryQueue`: durable retrying delivery of unpushed deltas
//! - `SyncOrchestrator`: the sync cycle state machine
//! - Collaborator traits for the remote, the entity store, connectivity and
//!   device identity, with in-memory implementations for tests
//!
//! ## Sync cycle
//!
//! 1. Load the device's watermarks; missing or unreadable state forces a
//!    full reconciliation from snapshots
//! 2. Fetch local deltas since the local watermark and remote deltas since
//!    the remote watermark, skipping our own and already applied ones
//! 3. Detect and resolve conflicts
//! 4. Apply remote deltas to the entity store in one batch
//! 5. Push local deltas; undelivered ones go to the offline queue
//! 6. Commit the new watermarks
//!
//! ## Key Invariants
//!
//! - Versions are assigned by the delta log alone and never repeat
//! - At most one sync cycle runs at a time
//! - A failed cycle leaves the committed watermarks untouched
//! - Applying a remote delta twice has no further effect

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod busy;
mod config;
mod connectivity;
mod delta_log;
mod device;
mod entity_store;
mod error;
mod offline_queue;
mod orchestrator;
mod plan;
mod remote;
mod resolver;
mod scheduler;

pub use config::{DeltaLogConfig, QueueConfig, RetryConfig, SchedulerConfig, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use delta_log::{DeltaLog, DeltaLogStats};
pub use device::{DeviceIdentity, FileDeviceIdentity, StaticDeviceIdentity};
pub use entity_store::{EntityStore, MemoryEntityStore};
pub use error::{SyncError, SyncResult};
pub use offline_queue::{DeliveryStatus, DrainReport, OfflineDeliveryQueue};
pub use orchestrator::{
    SyncOptions, SyncOrchestrator, SyncOutcome, SyncProgress, SyncReport, SyncStats, SyncStatus,
};
pub use remote::{MemoryRemote, RemoteProvider};
pub use resolver::ConflictResolver;
pub use scheduler::{
    BatchReport, OperationId, OperationOutcome, Priority, SchedulerStatus, UpdateHandler,
    UpdateKind, UpdateOperation, UpdateRequest, UpdateScheduler,
};
