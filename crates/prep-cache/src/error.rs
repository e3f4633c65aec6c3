use thiserror::Error;

/// Errors surfaced by the cache.
///
/// Only malformed keys and failed publishes are errors. Read-side I/O
/// failures are logged and reported as misses.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `put` was given `head` or `origin` instead of a resolved step id.
    #[error("step {0:?} is a reserved name and cannot be cached")]
    ReservedStep(String),

    #[error("cache key for dataset {dataset} has no step id")]
    MissingStep { dataset: String },

    #[error("cache key for dataset {dataset} has no output format")]
    MissingFormat { dataset: String },

    #[error("invalid cache key segment {segment:?}: {reason}")]
    InvalidSegment { segment: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
