use std::path::{Path, PathBuf};

use prep_cache::Sample;
use prep_engine::{Dataset, DatasetSource, EngineError, EngineResult};

/// Datasets stored as JSON envelopes, one `<id>.json` file each.
pub struct FileDatasets {
    dir: PathBuf,
}

impl FileDatasets {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Validate `source` as an envelope and store it under `dataset_id`.
    pub fn import(&self, dataset_id: &str, source: &Path) -> EngineResult<usize> {
        let path = self.path(dataset_id)?;
        let bytes = std::fs::read(source)
            .map_err(|e| EngineError::Internal(format!("failed to read {}: {e}", source.display())))?;
        let dataset: Dataset = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::MalformedResult(format!("{}: {e}", source.display())))?;
        let dataset = dataset.with_row_ids();
        let json = serde_json::to_vec(&dataset).map_err(|e| EngineError::Internal(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| EngineError::Internal(format!("failed to write {}: {e}", path.display())))?;
        tracing::info!(dataset = %dataset_id, rows = dataset.rows.len(), "imported dataset");
        Ok(dataset.rows.len())
    }

    fn path(&self, dataset_id: &str) -> EngineResult<PathBuf> {
        if dataset_id.is_empty() || dataset_id.contains(['/', '\\', '.']) {
            return Err(EngineError::DatasetNotFound(dataset_id.to_string()));
        }
        Ok(self.dir.join(format!("{dataset_id}.json")))
    }
}

impl DatasetSource for FileDatasets {
    fn open(&self, dataset_id: &str, sample: Sample) -> EngineResult<Dataset> {
        let path = self.path(dataset_id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::DatasetNotFound(dataset_id.to_string()))
            }
            Err(e) => {
                return Err(EngineError::Internal(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        let dataset: Dataset = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::MalformedResult(format!("{}: {e}", path.display())))?;
        Ok(dataset.with_row_ids().sampled(sample))
    }
}
