//! Error types for the sync engine.

use deltasync_protocol::ProtocolError;
use deltasync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Persistence error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid delta or change set.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A sync cycle is already running.
    #[error("sync already in progress")]
    SyncInProgress,

    /// A delta could not be applied to the entity store.
    #[error("failed to apply delta to {entity}: {reason}")]
    Apply {
        /// `kind:id` of the entity.
        entity: String,
        /// Underlying failure.
        reason: String,
    },

    /// No handler is registered for an update kind.
    #[error("no handler registered for {0}")]
    HandlerMissing(String),

    /// An update handler failed.
    #[error("update handler failed: {0}")]
    Handler(String),

    /// The strategy leaves conflicts to the caller.
    #[error("strategy {0} does not resolve conflicts automatically")]
    NotAutoResolvable(String),

    /// A manual resolution referenced an unknown or terminal conflict.
    #[error("conflict not pending: {0}")]
    ConflictNotPending(String),

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to remote")]
    NotConnected,

    /// Local I/O error outside the stores (e.g. device id file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}
