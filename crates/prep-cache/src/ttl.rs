use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifetime tiers for cache entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeToLive {
    /// One minute.
    Short,
    /// One hour.
    #[default]
    Default,
    /// One day.
    Long,
}

impl TimeToLive {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Short => Duration::from_secs(60),
            Self::Default => Duration::from_secs(60 * 60),
            Self::Long => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Absolute expiry for an entry written at `now_millis`.
    pub fn expiry_from(&self, now_millis: u64) -> u64 {
        now_millis.saturating_add(self.duration().as_millis() as u64)
    }
}
