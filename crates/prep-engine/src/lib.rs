//! Preparation engine.
//!
//! Ties the version chain, the derived-content cache and the dataflow
//! pipeline together. [`PreparationEngine`] is the entry point for
//! applications: it resolves a preparation's step, answers from the cache
//! when it can, and otherwise builds and runs the pipeline and memoizes the
//! result.
//!
//! # Key Types
//!
//! - [`PreparationEngine`] -- execute, preview and edit preparations
//! - [`EngineConfig`] -- TTL tiers, diff threading, incremental execution
//! - [`DatasetSource`] -- where input rows come from
//!
//! # Design Rules
//!
//! 1. Only resolved step ids are cached. The shared head result is keyed
//!    without a user; every other step is keyed per user.
//! 2. A failed run never leaves a cache entry behind.
//! 3. Cache failures degrade to recomputation, never to an error.

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;

pub use config::{EngineConfig, JSON_FORMAT};
pub use dataset::{Dataset, DatasetSource, InMemoryDatasets};
pub use engine::{ExecuteRequest, Execution, PreparationEngine, PreviewRequest, StepSummary};
pub use error::{EngineError, EngineResult};
