//! CLI command implementations.

pub mod conflicts;
pub mod dump_log;
pub mod inspect;
pub mod prune;
pub mod queue;
pub mod reset;

use deltasync_storage::{FileStore, StorageError, StoreOptions};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No store exists at the given path.
    #[error("no DeltaSync store found at {0}")]
    NoStore(String),

    /// A command argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store reported an error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Reading store metadata failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON output failed.
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Opens an existing store. Commands never create one.
pub fn open_store(path: &Path) -> CliResult<FileStore> {
    let options = StoreOptions {
        create_if_missing: false,
        ..StoreOptions::default()
    };
    FileStore::open_with_options(path, options).map_err(|e| match e {
        StorageError::NotFound(_) => CliError::NoStore(path.display().to_string()),
        other => other.into(),
    })
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats a millisecond timestamp relative to `now`.
pub fn format_age(timestamp: u64, now: u64) -> String {
    let secs = now.saturating_sub(timestamp) / 1000;
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
