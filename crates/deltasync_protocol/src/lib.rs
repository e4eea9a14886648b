//! # DeltaSync Protocol
//!
//! Pure data types and rules shared by every DeltaSync component.
//!
//! This crate provides:
//! - Identifiers (`DeltaId`, `DeviceId`, `ConflictId`, `QueueItemId`)
//! - `FieldValue` and the typed per-entity field keys
//! - `DeltaRecord`, the unit of replication
//! - `SyncVersionState` watermarks
//! - Conflict detection and the merge algorithms
//! - Entity snapshots used for full reconciliation
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod delta;
mod error;
mod fields;
mod ids;
mod merge;
mod queue;
mod snapshot;
mod state;
mod value;

pub use conflict::{detect_conflicts, ConflictInfo, ConflictStrategy, Resolution};
pub use delta::{now_millis, DeltaRecord, EntityChanges, FieldChange, OperationType};
pub use error::{ProtocolError, ProtocolResult};
pub use fields::{EmojiField, EntityKind, FavoritesField, FieldKey, GroupField, SettingsField};
pub use ids::{ConflictId, DeltaId, DeviceId, QueueItemId};
pub use merge::{
    diff_snapshots, smart_merge, three_way_merge, FieldConflict, MergeResult, Tiebreak,
};
pub use queue::QueueItem;
pub use snapshot::{EntityKey, EntitySnapshot, StoreSnapshot};
pub use state::SyncVersionState;
pub use value::FieldValue;
