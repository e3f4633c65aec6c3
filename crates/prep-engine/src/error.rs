use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] prep_store::StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] prep_cache::CacheError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] prep_pipeline::PipelineError),

    #[error("type error: {0}")]
    Type(#[from] prep_types::TypeError),

    #[error("malformed result: {0}")]
    MalformedResult(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
