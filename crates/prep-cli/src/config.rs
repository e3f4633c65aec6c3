use std::path::{Path, PathBuf};

use anyhow::Context;
use prep_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Settings read from `<root>/config.toml`.
///
/// Relative directories are resolved against the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub datasets_dir: PathBuf,
    pub engine: EngineConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("store"),
            cache_dir: PathBuf::from("cache"),
            datasets_dir: PathBuf::from("datasets"),
            engine: EngineConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn default_path(root: &Path) -> PathBuf {
        root.join("config.toml")
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        root.join(&self.store_dir)
    }

    pub fn cache_path(&self, root: &Path) -> PathBuf {
        root.join(&self.cache_dir)
    }

    pub fn datasets_path(&self, root: &Path) -> PathBuf {
        root.join(&self.datasets_dir)
    }
}
