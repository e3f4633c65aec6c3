//! Built-in demonstration actions.

use prep_pipeline::{ActionError, ActionRegistry, ActionResult};
use prep_types::action::COLUMN_ID;
use prep_types::{Parameters, Row, SchemaRef};

pub fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register("uppercase", map_cell(str::to_uppercase));
    registry.register("lowercase", map_cell(str::to_lowercase));
    registry.register("trim", map_cell(|v: &str| v.trim().to_string()));
    registry.register("delete_empty", delete_empty);
    registry
}

fn column(parameters: &Parameters) -> ActionResult<&str> {
    parameters
        .get(COLUMN_ID)
        .map(String::as_str)
        .ok_or_else(|| ActionError::new(format!("missing parameter {COLUMN_ID}")))
}

fn map_cell<F>(f: F) -> impl Fn(Row, SchemaRef, &Parameters) -> ActionResult<(Row, SchemaRef)>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    move |mut row: Row, schema: SchemaRef, parameters: &Parameters| -> ActionResult<(Row, SchemaRef)> {
        let column = column(parameters)?;
        if let Some(value) = row.get(column).map(&f) {
            row.set(column, value);
        }
        Ok((row, schema))
    }
}

/// Filters out rows whose column is missing or blank.
fn delete_empty(mut row: Row, schema: SchemaRef, parameters: &Parameters) -> ActionResult<(Row, SchemaRef)> {
    let column = column(parameters)?;
    if row.get(column).map_or(true, |v| v.trim().is_empty()) {
        row.set_deleted(true);
    }
    Ok((row, schema))
}
