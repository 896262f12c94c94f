//! Error types for the Draftline engine.

use crate::{EntityClass, EntityId};
use thiserror::Error;

/// All possible errors from the Draftline engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("entity class not declared: {0}")]
    UndeclaredClass(EntityClass),

    #[error("class '{0}' is neither ordered nor deferred")]
    UnorderedClass(EntityClass),

    #[error("class '{0}' appears more than once in the dependency order")]
    DuplicateOrderEntry(EntityClass),

    #[error("class '{child}' is ordered before its owner '{owner}'")]
    ChildBeforeOwner {
        owner: EntityClass,
        child: EntityClass,
    },

    // Document errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("duplicate entity id: {0}")]
    DuplicateEntity(EntityId),

    #[error("collection '{collection}' not declared on class '{class}'")]
    UnknownCollection {
        class: EntityClass,
        collection: String,
    },

    #[error("field '{field}' not declared on class '{class}'")]
    UnknownField { class: EntityClass, field: String },

    #[error("class mismatch in '{collection}': expected {expected}, got {got}")]
    ClassMismatch {
        collection: String,
        expected: EntityClass,
        got: EntityClass,
    },

    #[error("root id mismatch: expected {expected}, got {actual}")]
    RootMismatch { expected: EntityId, actual: EntityId },

    // Round trip errors
    #[error("a full save is in progress")]
    SaveInProgress,

    #[error("round trip {0} is not outstanding")]
    UnknownRoundTrip(u64),

    #[error("response has no result at operation index {0}")]
    MissingRootResult(usize),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
