//! Store directory management.
//!
//! This module handles the file system layout of a DeltaSync store:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ deltas.log        # Append-only local delta log
//! ├─ conflicts.log     # Append-only conflict history
//! ├─ queue.dat         # Offline delivery queue (rewritten atomically)
//! ├─ state.dat         # Version states and applied ledger (rewritten atomically)
//! └─ meta.dat          # Highest version ever appended, kept across pruning
//! ```

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const DELTAS_FILE: &str = "deltas.log";
const CONFLICTS_FILE: &str = "conflicts.log";
const QUEUE_FILE: &str = "queue.dat";
const STATE_FILE: &str = "state.dat";
const META_FILE: &str = "meta.dat";

/// Holds the exclusive lock on a store directory.
///
/// Only one `StoreDir` instance can exist per directory at a time; the lock
/// is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
        }

        if !path.is_dir() {
            return Err(StorageError::corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the delta log.
    #[must_use]
    pub fn deltas_path(&self) -> PathBuf {
        self.path.join(DELTAS_FILE)
    }

    /// Returns the path of the conflict history.
    #[must_use]
    pub fn conflicts_path(&self) -> PathBuf {
        self.path.join(CONFLICTS_FILE)
    }

    /// Returns the path of the queue file.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.path.join(QUEUE_FILE)
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    /// Returns the path to the version high-water file.
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }
}

/// Replaces `path` with `data` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp = path.with_extension("tmp");
    {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(())
}
