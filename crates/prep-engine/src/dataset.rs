use std::collections::HashMap;
use std::sync::RwLock;

use prep_cache::Sample;
use prep_types::{Row, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Input rows for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(rename = "metadata")]
    pub schema: Schema,
    #[serde(rename = "records")]
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    /// Give every row without an id its position as id.
    pub fn with_row_ids(mut self) -> Self {
        for (position, row) in self.rows.iter_mut().enumerate() {
            if row.id().is_none() {
                *row = std::mem::take(row).with_id(position as u64);
            }
        }
        self
    }

    /// The first `n` rows for a sampled run.
    pub fn sampled(mut self, sample: Sample) -> Self {
        if let Sample::Rows(n) = sample {
            self.rows.truncate(usize::try_from(n).unwrap_or(usize::MAX));
        }
        self
    }

    pub fn schema_ref(&self) -> SchemaRef {
        self.schema.clone().into_ref()
    }
}

/// Where the engine reads datasets from.
pub trait DatasetSource: Send + Sync {
    fn open(&self, dataset_id: &str, sample: Sample) -> EngineResult<Dataset>;
}

/// Datasets held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryDatasets {
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl InMemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset_id: impl Into<String>, dataset: Dataset) -> EngineResult<()> {
        self.datasets
            .write()
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .insert(dataset_id.into(), dataset.with_row_ids());
        Ok(())
    }
}

impl DatasetSource for InMemoryDatasets {
    fn open(&self, dataset_id: &str, sample: Sample) -> EngineResult<Dataset> {
        let datasets = self
            .datasets
            .read()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        datasets
            .get(dataset_id)
            .cloned()
            .map(|d| d.sampled(sample))
            .ok_or_else(|| EngineError::DatasetNotFound(dataset_id.to_string()))
    }
}
