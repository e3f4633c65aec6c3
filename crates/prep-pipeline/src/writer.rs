//! Envelope writer for single-branch runs.
//!
//! The writer is the only node that touches the output stream. It also
//! records the final schema so metadata requests can skip a recompute.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use prep_cache::{CacheKey, ContentCache, TimeToLive};
use prep_types::{Row, Schema, SchemaRef, Signal};

use crate::error::{poisoned, PipelineResult};
use crate::node::Node;
use crate::serializer::Serializer;

/// Where a writer publishes the final schema of its run.
#[derive(Clone)]
pub struct MetadataTarget {
    pub cache: Arc<dyn ContentCache>,
    pub key: CacheKey,
    pub ttl: TimeToLive,
}

/// Terminal node of a single-branch pipeline.
///
/// Serializes every writable row, then the last schema seen, into one
/// envelope. `CANCEL` stops all further output. `END_OF_STREAM` closes the
/// envelope, at most once; a run that saw no rows still produces a
/// well-formed envelope around the fallback schema.
pub struct WriterNode {
    state: Mutex<WriterState>,
    stopped: AtomicBool,
    fallback: SchemaRef,
    metadata: Option<MetadataTarget>,
}

struct WriterState {
    serializer: Box<dyn Serializer>,
    opened: bool,
    last_schema: Option<SchemaRef>,
    rows_written: u64,
}

impl WriterNode {
    /// `fallback` is written as the metadata of a run that saw no rows.
    pub fn new(serializer: Box<dyn Serializer>, fallback: SchemaRef) -> Self {
        Self {
            state: Mutex::new(WriterState {
                serializer,
                opened: false,
                last_schema: None,
                rows_written: 0,
            }),
            stopped: AtomicBool::new(false),
            fallback,
            metadata: None,
        }
    }

    /// Also store the final schema as JSON under `target.key`.
    pub fn with_metadata(mut self, target: MetadataTarget) -> Self {
        self.metadata = Some(target);
        self
    }

    /// Rows serialized so far. Deleted rows are not counted.
    pub fn rows_written(&self) -> u64 {
        self.state.lock().map(|s| s.rows_written).unwrap_or(0)
    }

    /// Whether a `CANCEL` has been received.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn finish(&self, state: &mut WriterState) -> PipelineResult<SchemaRef> {
        if !state.opened {
            state.serializer.open()?;
            state.opened = true;
        }
        let schema = state
            .last_schema
            .clone()
            .unwrap_or_else(|| self.fallback.clone());
        state.serializer.write_schema(&schema)?;
        state.serializer.close()?;
        state.serializer.flush()?;
        Ok(schema)
    }

    fn publish_metadata(&self, schema: &Schema) {
        let Some(target) = &self.metadata else {
            return;
        };
        let result = serde_json::to_vec(schema)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                target
                    .cache
                    .put_bytes(&target.key, target.ttl, &json)
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => tracing::debug!(key = %target.key, "stored result metadata"),
            Err(e) => tracing::warn!(key = %target.key, error = %e, "failed to store result metadata"),
        }
    }
}

impl Node for WriterNode {
    fn name(&self) -> &str {
        "writer"
    }

    fn receive(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if !state.opened {
            state.serializer.open()?;
            state.opened = true;
        }
        if row.should_write() {
            state.serializer.write_row(&row)?;
            state.rows_written += 1;
        }
        state.last_schema = Some(schema);
        Ok(())
    }

    fn signal(&self, signal: Signal) -> PipelineResult<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        match signal {
            Signal::Cancel => {
                if !self.stopped.swap(true, Ordering::AcqRel) {
                    tracing::debug!(rows = state.rows_written, "writer cancelled");
                }
                Ok(())
            }
            Signal::EndOfStream => {
                if self.stopped.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                let schema = self.finish(&mut state)?;
                drop(state);
                self.publish_metadata(&schema);
                Ok(())
            }
        }
    }
}
