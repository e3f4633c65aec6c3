use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::DiffFlag;

/// Shared, immutable schema handle. Links pass schemas by reference count;
/// a changed schema is always a new allocation.
pub type SchemaRef = Arc<Schema>;

/// Metadata for one column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_type")]
    pub column_type: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub statistics: Value,
    #[serde(rename = "__columnDiff", default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffFlag>,
}

fn default_type() -> String {
    "string".into()
}

impl Column {
    /// A string column with no domain or statistics.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            column_type: default_type(),
            domain: String::new(),
            statistics: Value::Null,
            diff: None,
        }
    }

    pub fn with_type(mut self, column_type: impl Into<String>) -> Self {
        self.column_type = column_type.into();
        self
    }

    fn same_shape(&self, other: &Column) -> bool {
        self.name == other.name && self.column_type == other.column_type
    }
}

/// Ordered column metadata for a row stream.
///
/// Every structural change returns a new `Schema`; an instance handed to a
/// link is never modified.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn into_ref(self) -> SchemaRef {
        Arc::new(self)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// A copy with `column` appended.
    pub fn with_column(&self, column: Column) -> Schema {
        let mut columns = self.columns.clone();
        columns.push(column);
        Schema { columns }
    }

    /// A copy with column `id` renamed. Unknown ids leave the copy unchanged.
    pub fn with_renamed(&self, id: &str, name: impl Into<String>) -> Schema {
        let name = name.into();
        let columns = self
            .columns
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if c.id == id {
                    c.name = name.clone();
                }
                c
            })
            .collect();
        Schema { columns }
    }

    /// A copy without column `id`.
    pub fn without_column(&self, id: &str) -> Schema {
        Schema {
            columns: self.columns.iter().filter(|c| c.id != id).cloned().collect(),
        }
    }

    /// Diff this schema (the candidate) against `reference`.
    ///
    /// Columns only the candidate has are flagged `new`, columns whose name
    /// or type changed are flagged `update`, and columns only the reference
    /// has are re-inserted at their reference position flagged `delete`.
    pub fn diff(&self, reference: &Schema) -> Schema {
        let mut columns: Vec<Column> = self
            .columns
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.diff = match reference.column(&c.id) {
                    None => Some(DiffFlag::New),
                    Some(old) if !old.same_shape(&c) => Some(DiffFlag::Update),
                    Some(_) => c.diff,
                };
                c
            })
            .collect();

        for (position, old) in reference.columns.iter().enumerate() {
            if self.column(&old.id).is_none() {
                let mut removed = old.clone();
                removed.diff = Some(DiffFlag::Delete);
                columns.insert(position.min(columns.len()), removed);
            }
        }

        Schema { columns }
    }

    /// Ids of columns flagged `new` by a previous [`diff`](Self::diff).
    pub fn created_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.diff == Some(DiffFlag::New))
            .map(|c| c.id.clone())
            .collect()
    }
}
