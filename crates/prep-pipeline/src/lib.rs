//! Streaming dataflow pipeline.
//!
//! A pipeline is a small graph of [`Node`]s joined by [`Link`]s. Rows are
//! pushed through synchronously: [`Link::emit`] returns only once the row
//! has been handled by every node downstream of it, so there is no internal
//! queue and no scheduler. Control [`Signal`](prep_types::Signal)s travel
//! the same edges.
//!
//! # Topologies
//!
//! - single branch: `actions... -> WriterNode`
//! - diff: `clone -> {reference actions, candidate actions} -> zip ->
//!   DiffWriterNode`
//!
//! [`PipelineBuilder`] assembles both from action lists.

pub mod action;
pub mod diff_writer;
pub mod error;
pub mod link;
pub mod node;
pub mod pipeline;
pub mod serializer;
pub mod writer;

pub use action::{ActionError, ActionNode, ActionRegistry, ActionResult, RowAction};
pub use diff_writer::DiffWriterNode;
pub use error::{PipelineError, PipelineResult};
pub use link::{CloneLink, Link, ZipLink, ZipPort};
pub use node::{Node, NodeRef};
pub use pipeline::{ExecutionSummary, Pipeline, PipelineBuilder};
pub use serializer::{JsonSerializer, OutputBuffer, Serializer};
pub use writer::{MetadataTarget, WriterNode};
