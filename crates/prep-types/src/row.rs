//! A single dataset record.
//!
//! Values are keyed by column id and kept in column-id order. A row also
//! carries a deleted flag (set by filtering actions) and, once it has been
//! diffed against another row, the resulting change markers.
//!
//! On the wire a row is one flat JSON object. Column values appear under
//! their ids; the reserved keys below carry the rest:
//!
//! | key         | meaning                                  |
//! |-------------|------------------------------------------|
//! | `__rowId`   | numeric row id, when the row has one     |
//! | `__rowDiff` | row-level [`DiffFlag`]                   |
//! | `__diff`    | object of column id to cell [`DiffFlag`] |

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::diff::{diff_values, CellChange, DiffFlag};

pub const ROW_ID_KEY: &str = "__rowId";
pub const ROW_DIFF_KEY: &str = "__rowDiff";
pub const CELL_DIFF_KEY: &str = "__diff";

/// Change markers accumulated by [`Row::diff`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowDiff {
    /// Row-level marker: the row appeared or disappeared.
    pub flag: Option<DiffFlag>,
    /// Per-cell markers, keyed by column id.
    pub cells: BTreeMap<String, DiffFlag>,
}

impl RowDiff {
    pub fn is_empty(&self) -> bool {
        self.flag.is_none() && self.cells.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    id: Option<u64>,
    values: BTreeMap<String, String>,
    deleted: bool,
    diff: Option<RowDiff>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from `(column id, value)` pairs.
    pub fn from_values<K, V, I>(values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn get(&self, column_id: &str) -> Option<&str> {
        self.values.get(column_id).map(String::as_str)
    }

    pub fn set(&mut self, column_id: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column_id.into(), value.into());
    }

    pub fn remove(&mut self, column_id: &str) -> Option<String> {
        self.values.remove(column_id)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    /// Markers left by the last [`diff`](Self::diff), if any.
    pub fn diff_markers(&self) -> Option<&RowDiff> {
        self.diff.as_ref()
    }

    /// Whether a writer should emit this row.
    ///
    /// A row that was never diffed is written unless deleted. After a diff,
    /// only rows carrying at least one change marker are written.
    pub fn should_write(&self) -> bool {
        match &self.diff {
            Some(diff) => !diff.is_empty(),
            None => !self.deleted,
        }
    }

    /// Diff this row (the candidate) against `reference`, accumulating
    /// markers.
    ///
    /// Calling this repeatedly against several references merges the
    /// markers; the first marker recorded for a cell wins. Values that only
    /// exist in the reference are copied back so the row can show what was
    /// removed.
    pub fn diff(&mut self, reference: &Row) {
        let markers = self.diff.get_or_insert_with(RowDiff::default);

        match (reference.deleted, self.deleted) {
            (true, false) => {
                markers.flag.get_or_insert(DiffFlag::New);
            }
            (false, true) => {
                markers.flag.get_or_insert(DiffFlag::Delete);
                for (key, value) in &reference.values {
                    self.values
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            (true, true) => {}
            (false, false) => {
                for change in diff_values(&reference.values, &self.values) {
                    markers
                        .cells
                        .entry(change.key().to_string())
                        .or_insert(change.flag());
                    if let CellChange::Removed { key, value } = change {
                        self.values.insert(key, value);
                    }
                }
            }
        }
    }

    /// Drop markers from a previous diff.
    pub fn clear_diff(&mut self) {
        self.diff = None;
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in &self.values {
            map.serialize_entry(key, value)?;
        }
        if let Some(id) = self.id {
            map.serialize_entry(ROW_ID_KEY, &id)?;
        }
        if let Some(diff) = &self.diff {
            if let Some(flag) = diff.flag {
                map.serialize_entry(ROW_DIFF_KEY, &flag)?;
            }
            if !diff.cells.is_empty() {
                map.serialize_entry(CELL_DIFF_KEY, &diff.cells)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut row = Row::new();
        let mut diff = RowDiff::default();

        for (key, value) in raw {
            match key.as_str() {
                ROW_ID_KEY => {
                    row.id = Some(
                        value
                            .as_u64()
                            .ok_or_else(|| D::Error::custom("row id must be an unsigned integer"))?,
                    );
                }
                ROW_DIFF_KEY => {
                    diff.flag = Some(serde_json::from_value(value).map_err(D::Error::custom)?);
                }
                CELL_DIFF_KEY => {
                    diff.cells = serde_json::from_value(value).map_err(D::Error::custom)?;
                }
                _ => {
                    let text = match value {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    row.values.insert(key, text);
                }
            }
        }

        if diff.flag == Some(DiffFlag::Delete) {
            row.deleted = true;
        }
        if !diff.is_empty() {
            row.diff = Some(diff);
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        Row::from_values(pairs.iter().copied())
    }

    #[test]
    fn undiffed_row_is_written_unless_deleted() {
        let mut r = row(&[("0000", "x")]);
        assert!(r.should_write());
        r.set_deleted(true);
        assert!(!r.should_write());
    }

    #[test]
    fn identical_rows_are_not_written_after_diff() {
        let reference = row(&[("0000", "x"), ("0001", "y")]);
        let mut candidate = reference.clone();
        candidate.diff(&reference);
        assert!(!candidate.should_write());
    }

    #[test]
    fn changed_cell_is_marked_update() {
        let reference = row(&[("0000", "x"), ("0001", "y")]);
        let mut candidate = row(&[("0000", "X"), ("0001", "y")]);
        candidate.diff(&reference);

        assert!(candidate.should_write());
        let markers = candidate.diff_markers().unwrap();
        assert_eq!(markers.flag, None);
        assert_eq!(markers.cells.len(), 1);
        assert_eq!(markers.cells["0000"], DiffFlag::Update);
    }

    #[test]
    fn removed_cell_is_restored_and_marked_delete() {
        let reference = row(&[("0000", "x"), ("0001", "y")]);
        let mut candidate = row(&[("0000", "x")]);
        candidate.diff(&reference);

        assert_eq!(candidate.get("0001"), Some("y"));
        assert_eq!(
            candidate.diff_markers().unwrap().cells["0001"],
            DiffFlag::Delete
        );
    }

    #[test]
    fn row_deleted_by_candidate_is_flagged_delete() {
        let reference = row(&[("0000", "x")]);
        let mut candidate = Row::new();
        candidate.set_deleted(true);
        candidate.diff(&reference);

        assert!(candidate.should_write());
        assert_eq!(candidate.diff_markers().unwrap().flag, Some(DiffFlag::Delete));
        assert_eq!(candidate.get("0000"), Some("x"));
    }

    #[test]
    fn row_restored_by_candidate_is_flagged_new() {
        let mut reference = row(&[("0000", "x")]);
        reference.set_deleted(true);
        let mut candidate = row(&[("0000", "x")]);
        candidate.diff(&reference);
        assert_eq!(candidate.diff_markers().unwrap().flag, Some(DiffFlag::New));
    }

    #[test]
    fn rows_deleted_on_both_sides_are_skipped() {
        let mut reference = row(&[("0000", "x")]);
        reference.set_deleted(true);
        let mut candidate = reference.clone();
        candidate.diff(&reference);
        assert!(!candidate.should_write());
    }

    #[test]
    fn serializes_values_then_markers() {
        let reference = row(&[("A", "x")]);
        let mut candidate = row(&[("A", "X")]).with_id(7);
        candidate.diff(&reference);
        let json = serde_json::to_string(&candidate).unwrap();
        assert_eq!(json, r#"{"A":"X","__rowId":7,"__diff":{"A":"update"}}"#);

        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn plain_row_serializes_as_flat_object() {
        let json = serde_json::to_string(&row(&[("A", "x"), ("B", "y")])).unwrap();
        assert_eq!(json, r#"{"A":"x","B":"y"}"#);
    }
}
