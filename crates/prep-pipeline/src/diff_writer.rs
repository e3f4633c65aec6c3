//! Diff writer.
//!
//! Rows arrive already paired by the zip. Output carries the candidate
//! values plus `__rowDiff`, `__diff` and `__columnDiff` markers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use prep_types::{Row, Schema, SchemaRef, Signal};

use crate::error::{poisoned, PipelineResult};
use crate::node::Node;
use crate::serializer::Serializer;

/// Terminal node of a diff pipeline.
///
/// Receives rounds of `source_number` rows (one per branch, reference
/// branches first, candidate last) and writes the candidate diffed against
/// the others, but only when the diff found something. The schema gets the
/// same treatment once, at end of stream.
pub struct DiffWriterNode {
    source_number: usize,
    state: Mutex<DiffState>,
    stopped: AtomicBool,
    fallback: SchemaRef,
}

struct DiffState {
    serializer: Box<dyn Serializer>,
    opened: bool,
    rows: Vec<Row>,
    schemas: Vec<SchemaRef>,
    rows_written: u64,
}

impl DiffWriterNode {
    /// `source_number` is the round size, one row per zipped branch.
    pub fn new(serializer: Box<dyn Serializer>, source_number: usize, fallback: SchemaRef) -> Self {
        Self {
            source_number: source_number.max(1),
            state: Mutex::new(DiffState {
                serializer,
                opened: false,
                rows: Vec::new(),
                schemas: Vec::new(),
                rows_written: 0,
            }),
            stopped: AtomicBool::new(false),
            fallback,
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.state.lock().map(|s| s.rows_written).unwrap_or(0)
    }

    fn push(&self, state: &mut DiffState, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        if !state.opened {
            state.serializer.open()?;
            state.opened = true;
        }
        state.rows.push(row);
        state.schemas.push(schema);
        if state.rows.len() >= self.source_number {
            Self::write_group(state, self.source_number)?;
            let keep = state.schemas.len().saturating_sub(self.source_number);
            state.schemas.drain(..keep);
        }
        Ok(())
    }

    /// Pop up to `size` rows; the first popped is diffed against the rest.
    fn write_group(state: &mut DiffState, size: usize) -> PipelineResult<()> {
        let Some(mut candidate) = state.rows.pop() else {
            return Ok(());
        };
        for _ in 1..size {
            match state.rows.pop() {
                Some(reference) => candidate.diff(&reference),
                None => break,
            }
        }
        if candidate.should_write() {
            state.serializer.write_row(&candidate)?;
            state.rows_written += 1;
        }
        Ok(())
    }

    fn diffed_schema(&self, state: &mut DiffState) -> Schema {
        let Some(candidate) = state.schemas.pop() else {
            return (*self.fallback).clone();
        };
        let mut schema = (*candidate).clone();
        for _ in 1..self.source_number {
            match state.schemas.pop() {
                Some(reference) => schema = schema.diff(&reference),
                None => break,
            }
        }
        schema
    }

    fn finish(&self, state: &mut DiffState) -> PipelineResult<()> {
        if !state.opened {
            state.serializer.open()?;
            state.opened = true;
        }
        while !state.rows.is_empty() {
            Self::write_group(state, self.source_number)?;
        }
        let schema = self.diffed_schema(state);
        state.serializer.write_schema(&schema)?;
        state.serializer.close()?;
        state.serializer.flush()
    }
}

impl Node for DiffWriterNode {
    fn name(&self) -> &str {
        "diff-writer"
    }

    fn receive(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        self.push(&mut state, row, schema)
    }

    fn receive_many(&self, rows: Vec<Row>, schemas: Vec<SchemaRef>) -> PipelineResult<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        for (row, schema) in rows.into_iter().zip(schemas) {
            self.push(&mut state, row, schema)?;
        }
        Ok(())
    }

    fn signal(&self, signal: Signal) -> PipelineResult<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        match signal {
            Signal::Cancel => {
                self.stopped.store(true, Ordering::Release);
                state.rows.clear();
                Ok(())
            }
            Signal::EndOfStream => {
                if self.stopped.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                tracing::debug!(rows = state.rows_written, "diff writer finished");
                self.finish(&mut state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{JsonSerializer, OutputBuffer};
    use prep_types::{Column, DiffFlag};
    use serde_json::Value;

    fn schema(columns: &[(&str, &str)]) -> SchemaRef {
        Schema::new(
            columns
                .iter()
                .map(|(id, name)| Column::new(*id, *name))
                .collect(),
        )
        .into_ref()
    }

    fn node() -> (DiffWriterNode, OutputBuffer) {
        let out = OutputBuffer::new();
        let node = DiffWriterNode::new(
            Box::new(JsonSerializer::new(out.clone())),
            2,
            schema(&[("A", "A")]),
        );
        (node, out)
    }

    fn parsed(out: &OutputBuffer) -> Value {
        serde_json::from_slice(&out.contents()).unwrap()
    }

    #[test]
    fn identical_branches_write_no_rows() {
        let (node, out) = node();
        let s = schema(&[("A", "A")]);
        for v in ["x", "y"] {
            let row = Row::from_values([("A", v)]);
            node.receive_many(vec![row.clone(), row], vec![s.clone(), s.clone()])
                .unwrap();
        }
        node.signal(Signal::EndOfStream).unwrap();

        let json = parsed(&out);
        assert_eq!(json["records"], Value::Array(vec![]));
        assert!(json["metadata"]["columns"][0].get("__columnDiff").is_none());
        assert_eq!(node.rows_written(), 0);
    }

    #[test]
    fn changed_cell_is_written_with_markers() {
        let (node, out) = node();
        let s = schema(&[("A", "A")]);
        node.receive_many(
            vec![
                Row::from_values([("A", "x")]).with_id(7),
                Row::from_values([("A", "X")]).with_id(7),
            ],
            vec![s.clone(), s],
        )
        .unwrap();
        node.signal(Signal::EndOfStream).unwrap();

        let json = parsed(&out);
        assert_eq!(
            json["records"][0],
            serde_json::json!({"A": "X", "__rowId": 7, "__diff": {"A": "update"}})
        );
    }

    #[test]
    fn candidate_deletion_restores_reference_values() {
        let (node, out) = node();
        let s = schema(&[("A", "A")]);
        let reference = Row::from_values([("A", "x")]);
        let mut candidate = Row::new();
        candidate.set_deleted(true);
        node.receive_many(vec![reference, candidate], vec![s.clone(), s])
            .unwrap();
        node.signal(Signal::EndOfStream).unwrap();

        let json = parsed(&out);
        assert_eq!(json["records"][0]["A"], "x");
        assert_eq!(json["records"][0]["__rowDiff"], "delete");
    }

    #[test]
    fn schema_diff_is_written_at_end_of_stream() {
        let (node, out) = node();
        let reference = schema(&[("A", "A")]);
        let candidate = schema(&[("A", "A"), ("B", "B")]);
        let row = Row::from_values([("A", "x")]);
        node.receive_many(vec![row.clone(), row], vec![reference, candidate])
            .unwrap();
        node.signal(Signal::EndOfStream).unwrap();

        let json = parsed(&out);
        let columns = json["metadata"]["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1]["id"], "B");
        assert_eq!(columns[1]["__columnDiff"], DiffFlag::New.to_string());
    }

    #[test]
    fn single_rows_are_grouped_by_source_number() {
        let (node, out) = node();
        let s = schema(&[("A", "A")]);
        node.receive(Row::from_values([("A", "x")]), s.clone())
            .unwrap();
        node.receive(Row::from_values([("A", "z")]), s).unwrap();
        node.signal(Signal::EndOfStream).unwrap();

        let json = parsed(&out);
        assert_eq!(json["records"].as_array().unwrap().len(), 1);
        assert_eq!(json["records"][0]["A"], "z");
    }

    #[test]
    fn no_rows_falls_back_to_the_default_schema() {
        let (node, out) = node();
        node.signal(Signal::EndOfStream).unwrap();
        assert_eq!(
            String::from_utf8(out.contents()).unwrap(),
            r#"{"records":[],"metadata":{"columns":[{"id":"A","name":"A","type":"string","domain":""}]}}"#
        );
    }

    #[test]
    fn cancel_discards_pending_rows_and_stops_output() {
        let (node, out) = node();
        let s = schema(&[("A", "A")]);
        node.receive(Row::from_values([("A", "x")]), s.clone())
            .unwrap();
        node.signal(Signal::Cancel).unwrap();
        node.receive(Row::from_values([("A", "y")]), s).unwrap();
        node.signal(Signal::EndOfStream).unwrap();

        assert_eq!(
            String::from_utf8(out.contents()).unwrap(),
            r#"{"records":["#
        );
    }
}
