//! Edges between nodes.
//!
//! A [`Link`] is the only way a node hands rows to the next one. Three
//! shapes exist:
//!
//! - `Direct`: straight to one node.
//! - `FanOut`: a [`CloneLink`] copying every row into several branches.
//! - `FanIn`: one input port of a [`ZipLink`] that gathers one row from
//!   each of its sources and hands the round to a single target.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use prep_types::{Row, SchemaRef, Signal};

use crate::error::{poisoned, PipelineError, PipelineResult};
use crate::node::NodeRef;

/// Outgoing edge of a node.
pub enum Link {
    Direct(NodeRef),
    FanOut(CloneLink),
    FanIn(ZipPort),
}

impl Link {
    /// A 1:1 link to `node`.
    pub fn direct(node: NodeRef) -> Self {
        Self::Direct(node)
    }

    /// Hand one row downstream.
    ///
    /// On a zip port this may block until the other sources have delivered
    /// their row for the current round.
    pub fn emit(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        match self {
            Self::Direct(node) => node.receive(row, schema),
            Self::FanOut(clone) => clone.emit(row, schema),
            Self::FanIn(port) => port.emit(row, schema),
        }
    }

    /// Hand a batch downstream, `schemas[i]` describing `rows[i]`.
    ///
    /// Zip ports take rows one at a time and reject batches.
    pub fn emit_many(&self, rows: Vec<Row>, schemas: Vec<SchemaRef>) -> PipelineResult<()> {
        match self {
            Self::Direct(node) => node.receive_many(rows, schemas),
            Self::FanOut(clone) => clone.emit_many(rows, schemas),
            Self::FanIn(_) => Err(PipelineError::Unsupported {
                node: "zip".into(),
                operation: "multi-row emit",
            }),
        }
    }

    /// Forward a control signal. Fan-out links forward to every branch.
    pub fn signal(&self, signal: Signal) -> PipelineResult<()> {
        match self {
            Self::Direct(node) => node.signal(signal),
            Self::FanOut(clone) => clone.signal(signal),
            Self::FanIn(port) => port.signal(signal),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Copies every row to each target, in target order.
///
/// The schema delivered is the one seen with the first row: later schemas
/// are ignored. Actions upstream of a clone are expected not to change the
/// schema row by row.
pub struct CloneLink {
    targets: Vec<Link>,
    first_schema: OnceLock<SchemaRef>,
    first_schemas: OnceLock<Vec<SchemaRef>>,
}

impl CloneLink {
    pub fn new(targets: Vec<Link>) -> Self {
        Self {
            targets,
            first_schema: OnceLock::new(),
            first_schemas: OnceLock::new(),
        }
    }

    pub fn targets(&self) -> &[Link] {
        &self.targets
    }

    /// Deliver `row` to every target. Every target is tried; the first
    /// error is returned.
    pub fn emit(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        let schema = self.first_schema.get_or_init(|| schema).clone();
        let mut first_error = None;
        for target in &self.targets {
            if let Err(e) = target.emit(row.clone(), schema.clone()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Batched variant of [`emit`](Self::emit). Schemas are memoized per
    /// position from the first batch; positions past its length keep the
    /// schema they were given.
    pub fn emit_many(&self, rows: Vec<Row>, schemas: Vec<SchemaRef>) -> PipelineResult<()> {
        let memo = self.first_schemas.get_or_init(|| schemas.clone());
        let schemas: Vec<SchemaRef> = schemas
            .into_iter()
            .enumerate()
            .map(|(i, s)| memo.get(i).cloned().unwrap_or(s))
            .collect();
        let mut first_error = None;
        for target in &self.targets {
            if let Err(e) = target.emit_many(rows.clone(), schemas.clone()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn signal(&self, signal: Signal) -> PipelineResult<()> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(e) = target.signal(signal) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Fan-in
// ---------------------------------------------------------------------------

/// Rendezvous of `sources` upstream branches in front of one target.
///
/// Each source owns one slot. A source that emits while its slot is still
/// full blocks until the current round has been handed off, which lets the
/// branches run on separate threads and still stay in lock step. Rows are
/// delivered to the target as one `receive_many` call, in source order.
///
/// A signal is forwarded once every source has raised it. `CANCEL` also
/// closes the zip immediately: waiting sources are released and later rows
/// are dropped.
pub struct ZipLink {
    sources: usize,
    target: NodeRef,
    state: Mutex<ZipState>,
    slot_freed: Condvar,
}

struct ZipState {
    slots: Vec<Option<(Row, SchemaRef)>>,
    filled: usize,
    raised: HashMap<Signal, Vec<bool>>,
    closed: bool,
}

impl ZipLink {
    pub fn new(sources: usize, target: NodeRef) -> Arc<Self> {
        Arc::new(Self {
            sources,
            target,
            state: Mutex::new(ZipState {
                slots: (0..sources).map(|_| None).collect(),
                filled: 0,
                raised: HashMap::new(),
                closed: false,
            }),
            slot_freed: Condvar::new(),
        })
    }

    /// One input link per source, in source order.
    ///
    /// Port `i` is what branch `i` must emit into; the target sees row `i`
    /// of each round at position `i`.
    pub fn ports(self: &Arc<Self>) -> Vec<Link> {
        (0..self.sources)
            .map(|index| {
                Link::FanIn(ZipPort {
                    zip: Arc::clone(self),
                    index,
                })
            })
            .collect()
    }

    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn target(&self) -> &NodeRef {
        &self.target
    }

    fn emit(&self, index: usize, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        let round = {
            let mut state = self.state.lock().map_err(poisoned)?;
            while state.slots[index].is_some() && !state.closed {
                state = self.slot_freed.wait(state).map_err(poisoned)?;
            }
            if state.closed {
                return Ok(());
            }
            state.slots[index] = Some((row, schema));
            state.filled += 1;
            if state.filled < self.sources {
                return Ok(());
            }
            state.filled = 0;
            let round: Vec<(Row, SchemaRef)> =
                state.slots.iter_mut().filter_map(Option::take).collect();
            self.slot_freed.notify_all();
            round
        };

        let (rows, schemas) = round.into_iter().unzip();
        self.target.receive_many(rows, schemas)
    }

    fn signal(&self, index: usize, signal: Signal) -> PipelineResult<()> {
        let forward = {
            let mut state = self.state.lock().map_err(poisoned)?;
            if signal == Signal::Cancel && !state.closed {
                state.closed = true;
                self.slot_freed.notify_all();
            }
            let sources = self.sources;
            let raised = state
                .raised
                .entry(signal)
                .or_insert_with(|| vec![false; sources]);
            raised[index] = true;
            if raised.iter().all(|r| *r) {
                state.raised.remove(&signal);
                if signal == Signal::EndOfStream && state.filled > 0 {
                    tracing::warn!(
                        filled = state.filled,
                        sources = self.sources,
                        "dropping incomplete round at end of stream"
                    );
                    state.slots.iter_mut().for_each(|s| *s = None);
                    state.filled = 0;
                }
                true
            } else {
                false
            }
        };

        if forward {
            self.target.signal(signal)
        } else {
            Ok(())
        }
    }
}

/// The input of one source of a [`ZipLink`].
pub struct ZipPort {
    zip: Arc<ZipLink>,
    index: usize,
}

impl ZipPort {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn zip(&self) -> &Arc<ZipLink> {
        &self.zip
    }

    pub fn emit(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        self.zip.emit(self.index, row, schema)
    }

    pub fn signal(&self, signal: Signal) -> PipelineResult<()> {
        self.zip.signal(self.index, signal)
    }
}
