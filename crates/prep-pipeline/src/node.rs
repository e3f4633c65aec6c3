use std::sync::Arc;

use prep_types::{Row, SchemaRef, Signal};

use crate::error::{PipelineError, PipelineResult};
use crate::link::Link;

/// A processing step in a pipeline.
///
/// Implemented by [`ActionNode`](crate::ActionNode),
/// [`WriterNode`](crate::WriterNode) and
/// [`DiffWriterNode`](crate::DiffWriterNode). Nodes are shared between
/// threads when two branches of a diff pipeline run concurrently, so every
/// method takes `&self`.
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Process one row. Returns once the row has been fully handled
    /// downstream.
    fn receive(&self, row: Row, schema: SchemaRef) -> PipelineResult<()>;

    /// Process one round of rows from a fan-in link, in source order.
    fn receive_many(&self, rows: Vec<Row>, schemas: Vec<SchemaRef>) -> PipelineResult<()> {
        let _ = (rows, schemas);
        Err(PipelineError::Unsupported {
            node: self.name().to_string(),
            operation: "multi-row receive",
        })
    }

    fn signal(&self, signal: Signal) -> PipelineResult<()>;

    /// The outgoing link, for nodes that have one.
    fn link(&self) -> Option<&Link> {
        None
    }
}

pub type NodeRef = Arc<dyn Node>;
