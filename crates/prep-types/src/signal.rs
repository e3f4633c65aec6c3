use std::fmt;

use serde::{Deserialize, Serialize};

/// Out-of-band control message.
///
/// Signals travel the same links as rows but are not tied to any row
/// position in the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    /// No more rows will follow.
    EndOfStream,
    /// Abandon the run. Terminal nodes drop everything after this.
    Cancel,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "END_OF_STREAM"),
            Self::Cancel => write!(f, "CANCEL"),
        }
    }
}
