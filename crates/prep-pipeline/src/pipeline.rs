//! Pipeline assembly and execution.
//!
//! # Shapes
//!
//! - single: `action* -> writer`
//! - diff: `clone -> {action* -> zip[0], action* -> zip[1]} -> diff-writer`
//!
//! [`Pipeline::execute`] drives every branch on the caller's thread.
//! [`Pipeline::execute_concurrent`] gives each fan-out branch its own
//! scoped thread; the zip keeps them in lock step.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prep_types::{Action, Row, SchemaRef, Signal};

use crate::action::{ActionNode, ActionRegistry};
use crate::error::{PipelineError, PipelineResult};
use crate::link::{CloneLink, Link, ZipLink};
use crate::node::NodeRef;

/// Counters from one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub rows_in: u64,
}

/// A built node graph, driven from its entry link.
pub struct Pipeline {
    entry: Link,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Wrap an assembled graph. See [`PipelineBuilder`] for the usual shapes.
    pub fn new(entry: Link) -> Self {
        Self {
            entry,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn entry(&self) -> &Link {
        &self.entry
    }

    /// Whether [`cancel`](Self::cancel) ran, directly or after a failure.
    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Push one row into the graph.
    pub fn receive(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.entry.emit(row, schema)
    }

    /// Send `signal` through the entry link.
    pub fn signal(&self, signal: Signal) -> PipelineResult<()> {
        self.entry.signal(signal)
    }

    /// Stop the run. Terminal nodes discard everything after this.
    pub fn cancel(&self) -> PipelineResult<()> {
        self.stopped.store(true, Ordering::Release);
        self.entry.signal(Signal::Cancel)
    }

    /// Feed `rows` in order, then `END_OF_STREAM`.
    ///
    /// The first failing row aborts the run: the graph is cancelled and the
    /// error returned.
    pub fn execute<I>(&self, schema: SchemaRef, rows: I) -> PipelineResult<ExecutionSummary>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut summary = ExecutionSummary::default();
        for row in rows {
            if let Err(e) = self.receive(row, schema.clone()) {
                self.abort(&e);
                return Err(e);
            }
            summary.rows_in += 1;
        }
        if let Err(e) = self.entry.signal(Signal::EndOfStream) {
            self.abort(&e);
            return Err(e);
        }
        Ok(summary)
    }

    /// Like [`execute`](Self::execute), but each branch of a fan-out entry
    /// runs on its own thread. Falls back to `execute` for other entries.
    pub fn execute_concurrent(
        &self,
        schema: SchemaRef,
        rows: Vec<Row>,
    ) -> PipelineResult<ExecutionSummary> {
        let Link::FanOut(clone) = &self.entry else {
            return self.execute(schema, rows);
        };

        let results: Vec<PipelineResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = clone
                .targets()
                .iter()
                .map(|branch| {
                    let rows = &rows;
                    let schema = schema.clone();
                    let stopped = &self.stopped;
                    scope.spawn(move || run_branch(branch, &schema, rows, stopped))
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(i, h)| h.join().unwrap_or(Err(PipelineError::BranchPanicked(i))))
                .collect()
        });

        // A branch released by a sibling's cancel reports `Cancelled`; the
        // sibling's own error is the one worth returning.
        let mut errors: Vec<PipelineError> = results.into_iter().filter_map(Result::err).collect();
        let cause = match errors
            .iter()
            .position(|e| !matches!(e, PipelineError::Cancelled))
        {
            Some(i) => Some(errors.swap_remove(i)),
            None => errors.pop(),
        };

        match cause {
            Some(e) => {
                self.abort(&e);
                Err(e)
            }
            None => Ok(ExecutionSummary {
                rows_in: rows.len() as u64,
            }),
        }
    }

    fn abort(&self, cause: &PipelineError) {
        tracing::warn!(error = %cause, "pipeline run failed, cancelling");
        if let Err(e) = self.cancel() {
            tracing::warn!(error = %e, "cancel signal failed");
        }
    }
}

/// Drive one branch to completion. A failing or panicking branch cancels
/// itself so sibling branches waiting on a shared zip are released.
fn run_branch(
    branch: &Link,
    schema: &SchemaRef,
    rows: &[Row],
    stopped: &AtomicBool,
) -> PipelineResult<()> {
    let _guard = CancelOnPanic(branch);
    for row in rows {
        if stopped.load(Ordering::Acquire) {
            return Err(PipelineError::Cancelled);
        }
        if let Err(e) = branch.emit(row.clone(), schema.clone()) {
            stopped.store(true, Ordering::Release);
            let _ = branch.signal(Signal::Cancel);
            return Err(e);
        }
    }
    if stopped.load(Ordering::Acquire) {
        return Err(PipelineError::Cancelled);
    }
    branch.signal(Signal::EndOfStream)
}

struct CancelOnPanic<'a>(&'a Link);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = self.0.signal(Signal::Cancel);
        }
    }
}

// ---------------------------------------------------------------------------
// Topology dump
// ---------------------------------------------------------------------------

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_link(f, &self.entry, 0)
    }
}

fn write_link(f: &mut fmt::Formatter<'_>, link: &Link, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    match link {
        Link::Direct(node) => write_node(f, node, depth),
        Link::FanOut(clone) => {
            writeln!(f, "{indent}clone x{}", clone.targets().len())?;
            for target in clone.targets() {
                write_link(f, target, depth + 1)?;
            }
            Ok(())
        }
        Link::FanIn(port) => {
            let zip = port.zip();
            writeln!(f, "{indent}zip [{}/{}]", port.index() + 1, zip.sources())?;
            // The shared target is printed once, under the last source.
            if port.index() + 1 == zip.sources() {
                write_node(f, zip.target(), depth.saturating_sub(1))?;
            }
            Ok(())
        }
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &NodeRef, depth: usize) -> fmt::Result {
    writeln!(f, "{}{}", "  ".repeat(depth), node.name())?;
    match node.link() {
        Some(next) => write_link(f, next, depth),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles pipelines from action lists, back to front.
pub struct PipelineBuilder<'a> {
    registry: &'a ActionRegistry,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self { registry }
    }

    /// `actions` chained in order in front of `terminal`.
    pub fn chain(&self, actions: &[Action], terminal: Link) -> PipelineResult<Link> {
        actions.iter().rev().try_fold(terminal, |next, action| {
            let implementation = self.registry.resolve(action)?;
            let node: NodeRef = Arc::new(ActionNode::new(action.clone(), implementation, next));
            Ok(Link::direct(node))
        })
    }

    /// `actions -> writer`.
    ///
    /// Every action is resolved against the registry first; an unknown
    /// name fails the build and nothing is run.
    pub fn single(&self, actions: &[Action], writer: NodeRef) -> PipelineResult<Pipeline> {
        Ok(Pipeline::new(self.chain(actions, Link::direct(writer))?))
    }

    /// `clone -> {reference, candidate} -> zip -> diff_writer`.
    ///
    /// The reference branch feeds zip port 0 and the candidate port 1, so
    /// each round reaches the diff writer with the candidate last.
    pub fn diff(
        &self,
        reference: &[Action],
        candidate: &[Action],
        diff_writer: NodeRef,
    ) -> PipelineResult<Pipeline> {
        let zip = ZipLink::new(2, diff_writer);
        let mut ports = zip.ports().into_iter();
        let (Some(reference_port), Some(candidate_port)) = (ports.next(), ports.next()) else {
            return Err(PipelineError::Arity {
                expected: 2,
                actual: zip.sources(),
            });
        };
        let branches = vec![
            self.chain(reference, reference_port)?,
            self.chain(candidate, candidate_port)?,
        ];
        Ok(Pipeline::new(Link::FanOut(CloneLink::new(branches))))
    }
}
