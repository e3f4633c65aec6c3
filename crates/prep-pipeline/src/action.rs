//! Action implementations and the node that runs them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prep_types::{Action, Parameters, Row, SchemaRef, Signal};
use thiserror::Error;

use crate::error::{PipelineError, PipelineResult};
use crate::link::Link;
use crate::node::Node;

/// Failure reported by a [`RowAction`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ActionResult<T> = Result<T, ActionError>;

/// A row-level transformation.
///
/// Receives each live row with its schema and returns the (possibly
/// modified) pair. Marking the row deleted filters it out; returning a new
/// schema changes the columns seen downstream.
pub trait RowAction: Send + Sync {
    fn apply(
        &self,
        row: Row,
        schema: SchemaRef,
        parameters: &Parameters,
    ) -> ActionResult<(Row, SchemaRef)>;
}

impl<F> RowAction for F
where
    F: Fn(Row, SchemaRef, &Parameters) -> ActionResult<(Row, SchemaRef)> + Send + Sync,
{
    fn apply(
        &self,
        row: Row,
        schema: SchemaRef,
        parameters: &Parameters,
    ) -> ActionResult<(Row, SchemaRef)> {
        self(row, schema, parameters)
    }
}

/// Maps action names to their implementations.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn RowAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl RowAction + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RowAction>> {
        self.actions.get(name).cloned()
    }

    /// Look up the implementation for `action`, failing on unknown names.
    pub fn resolve(&self, action: &Action) -> PipelineResult<Arc<dyn RowAction>> {
        self.get(&action.name)
            .ok_or_else(|| PipelineError::UnknownAction(action.name.clone()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionNode
// ---------------------------------------------------------------------------

/// Applies one action to every live row and forwards the result.
///
/// Deleted rows are forwarded untouched so that a downstream diff writer
/// still sees one row per input row.
pub struct ActionNode {
    name: String,
    action: Action,
    implementation: Arc<dyn RowAction>,
    next: Link,
    applied: AtomicU64,
}

impl ActionNode {
    pub fn new(action: Action, implementation: Arc<dyn RowAction>, next: Link) -> Self {
        Self {
            name: format!("action:{}", action.name),
            action,
            implementation,
            next,
            applied: AtomicU64::new(0),
        }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Number of rows the action has been applied to.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl Node for ActionNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, row: Row, schema: SchemaRef) -> PipelineResult<()> {
        if row.is_deleted() {
            return self.next.emit(row, schema);
        }
        let (row, schema) = self
            .implementation
            .apply(row, schema, &self.action.parameters)
            .map_err(|e| PipelineError::Action {
                action: self.action.name.clone(),
                reason: e.0,
            })?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.next.emit(row, schema)
    }

    fn signal(&self, signal: Signal) -> PipelineResult<()> {
        self.next.signal(signal)
    }

    fn link(&self) -> Option<&Link> {
        Some(&self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_types::{Column, Schema};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<Row>>);

    impl Node for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        fn receive(&self, row: Row, _schema: SchemaRef) -> PipelineResult<()> {
            self.0.lock().unwrap().push(row);
            Ok(())
        }
        fn signal(&self, _signal: Signal) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn uppercase(row: Row, schema: SchemaRef, p: &Parameters) -> ActionResult<(Row, SchemaRef)> {
        let mut row = row;
        let column = p
            .get("column_id")
            .ok_or_else(|| ActionError::new("missing column_id"))?;
        if let Some(v) = row.get(column).map(str::to_uppercase) {
            row.set(column.clone(), v);
        }
        Ok((row, schema))
    }

    fn schema() -> SchemaRef {
        Schema::new(vec![Column::new("A", "A")]).into_ref()
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let mut registry = ActionRegistry::new();
        registry.register("uppercase", uppercase);
        assert!(registry.resolve(&Action::new("uppercase")).is_ok());
        assert!(matches!(
            registry.resolve(&Action::new("nope")),
            Err(PipelineError::UnknownAction(name)) if name == "nope"
        ));
        assert_eq!(registry.names(), vec!["uppercase"]);
    }

    #[test]
    fn action_node_applies_to_live_rows_only() {
        let sink = Arc::new(Sink::default());
        let node = ActionNode::new(
            Action::new("uppercase").on_column("A"),
            Arc::new(uppercase),
            Link::direct(sink.clone()),
        );

        node.receive(Row::from_values([("A", "x")]), schema()).unwrap();
        let mut deleted = Row::from_values([("A", "y")]);
        deleted.set_deleted(true);
        node.receive(deleted, schema()).unwrap();

        let rows = sink.0.lock().unwrap();
        assert_eq!(rows[0].get("A"), Some("X"));
        assert_eq!(rows[1].get("A"), Some("y"));
        assert!(rows[1].is_deleted());
        assert_eq!(node.applied(), 1);
    }

    #[test]
    fn action_failure_names_the_action() {
        let sink = Arc::new(Sink::default());
        let node = ActionNode::new(
            Action::new("uppercase"),
            Arc::new(uppercase),
            Link::direct(sink),
        );
        let err = node
            .receive(Row::from_values([("A", "x")]), schema())
            .unwrap_err();
        assert!(
            matches!(err, PipelineError::Action { action, reason } if action == "uppercase" && reason == "missing column_id")
        );
    }
}
