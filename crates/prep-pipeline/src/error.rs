use prep_cache::CacheError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An action's implementation failed on a row.
    #[error("action {action} failed: {reason}")]
    Action { action: String, reason: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("{node} does not support {operation}")]
    Unsupported {
        node: String,
        operation: &'static str,
    },

    #[error("expected {expected} rows per round, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("metadata cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("branch {0} panicked")]
    BranchPanicked(usize),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> PipelineError {
    PipelineError::LockPoisoned(e.to_string())
}

pub type PipelineResult<T> = Result<T, PipelineError>;
