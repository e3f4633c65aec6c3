use std::path::Path;
use std::time::Duration;

use prep_cache::TimeToLive;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Output format produced by the JSON envelope serializer.
pub const JSON_FORMAT: &str = "json";

/// Engine settings. Every field has a default, so a TOML file only needs
/// the keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of cached pipeline output.
    pub content_ttl: TimeToLive,
    /// Lifetime of cached result schemas.
    pub metadata_ttl: TimeToLive,
    /// Seconds between janitor sweeps.
    pub janitor_period_secs: u64,
    /// Run the two branches of a preview on separate threads.
    pub concurrent_branches: bool,
    /// Reuse a cached parent result and apply only the newest actions.
    pub incremental: bool,
    pub default_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_ttl: TimeToLive::Default,
            metadata_ttl: TimeToLive::Long,
            janitor_period_secs: 60,
            concurrent_branches: true,
            incremental: true,
            default_format: JSON_FORMAT.into(),
        }
    }
}

impl EngineConfig {
    /// Single-threaded, always-from-scratch settings.
    pub fn sequential() -> Self {
        Self {
            concurrent_branches: false,
            incremental: false,
            ..Default::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> EngineResult<Self> {
        toml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn janitor_period(&self) -> Duration {
        Duration::from_secs(self.janitor_period_secs.max(1))
    }
}
