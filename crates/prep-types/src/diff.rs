//! Structural change markers shared by rows and schemas.
//!
//! Values are compared key by key: keys only in the newer map are additions,
//! keys only in the older map are removals, and keys in both with a
//! different value are modifications.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker attached to a row, a cell, or a column after a diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFlag {
    New,
    Update,
    Delete,
}

impl fmt::Display for DiffFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single cell-level difference between two value maps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellChange {
    Added { key: String, value: String },
    Removed { key: String, value: String },
    Modified { key: String, old: String, new: String },
}

impl CellChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Removed { key, .. } | Self::Modified { key, .. } => key,
        }
    }

    pub fn flag(&self) -> DiffFlag {
        match self {
            Self::Added { .. } => DiffFlag::New,
            Self::Removed { .. } => DiffFlag::Delete,
            Self::Modified { .. } => DiffFlag::Update,
        }
    }
}

/// Compare two value maps, returning changes in key order.
pub fn diff_values(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Vec<CellChange> {
    let mut changes = Vec::new();

    for (key, old_val) in old {
        match new.get(key) {
            Some(new_val) if new_val != old_val => changes.push(CellChange::Modified {
                key: key.clone(),
                old: old_val.clone(),
                new: new_val.clone(),
            }),
            Some(_) => {}
            None => changes.push(CellChange::Removed {
                key: key.clone(),
                value: old_val.clone(),
            }),
        }
    }

    for (key, new_val) in new {
        if !old.contains_key(key) {
            changes.push(CellChange::Added {
                key: key.clone(),
                value: new_val.clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.key().cmp(b.key()));
    changes
}
