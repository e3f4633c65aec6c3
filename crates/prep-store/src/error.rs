use prep_types::{ObjectId, TypeError};

use crate::object::ObjectKind;

/// Errors from the store and the version chain manager.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("preparation not found: {0}")]
    PreparationNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(ObjectId),

    #[error("content not found: {0}")]
    ContentNotFound(ObjectId),

    /// A step's parent (or content) is missing from the store.
    #[error("broken chain at step {step}: missing {missing}")]
    BrokenChain { step: ObjectId, missing: ObjectId },

    #[error("step {step} is not part of preparation {preparation}")]
    StepNotInChain { step: ObjectId, preparation: String },

    #[error("the root step cannot be modified")]
    RootStepImmutable,

    /// Stored bytes do not decode, or do not hash to their key.
    #[error("corrupt {kind} object {id}: {reason}")]
    CorruptObject {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
