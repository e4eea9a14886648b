//! # DeltaSync Storage
//!
//! Persistence traits and implementations for DeltaSync.
//!
//! The sync engine never touches files directly; it talks to four narrow
//! traits:
//!
//! - [`DeltaStore`] - append-only log of local deltas
//! - [`QueueStore`] - durable FIFO for the offline delivery queue
//! - [`SyncStateStore`] - watermarks and the applied-delta ledger
//! - [`ConflictHistoryStore`] - append-only conflict history
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - For persistent storage in a locked directory
//!
//! ## Example
//!
//! ```rust
//! use deltasync_storage::{DeltaStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! assert_eq!(store.delta_count().unwrap(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod dir;
mod error;
mod file;
pub mod frame;
mod memory;

pub use backend::{ConflictHistoryStore, DeltaStore, QueueStore, SyncStateStore};
pub use dir::StoreDir;
pub use error::{StorageError, StorageResult};
pub use file::{FileStore, StoreOptions};
pub use memory::MemoryStore;
