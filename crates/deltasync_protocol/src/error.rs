//! Protocol error types.

use crate::fields::EntityKind;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by protocol-level validation and snapshot application.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Two change sets for different entity kinds were combined.
    #[error("entity kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind the operation expected.
        expected: EntityKind,
        /// Kind that was supplied.
        found: EntityKind,
    },

    /// A delta referenced an entity that does not exist.
    #[error("entity not found: {kind}/{entity_id}")]
    MissingEntity {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        entity_id: String,
    },

    /// A delta carried an empty entity identifier.
    #[error("delta has an empty entity id")]
    EmptyEntityId,

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflict strategy name was not recognised.
    #[error("unknown conflict strategy: {0}")]
    UnknownStrategy(String),
}
