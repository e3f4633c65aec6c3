//! Derived-content cache.
//!
//! Pipeline outputs are memoized per (dataset, preparation, step, sample,
//! format) and, for results that are not the shared head result, per user.
//! Entries carry an absolute expiry. Eviction is logical and prefix-scoped:
//! evicting a preparation invalidates every step, sample, and format below
//! it in one call. A [`Janitor`] physically deletes expired and evicted
//! entries on a fixed period.
//!
//! # Backends
//!
//! - [`InMemoryContentCache`] -- entries held as [`bytes::Bytes`]
//! - [`FileSystemContentCache`] -- one file per entry, expiry in the file
//!   name, eviction by rename

pub mod clock;
pub mod error;
pub mod fs;
pub mod janitor;
pub mod key;
pub mod memory;
pub mod traits;
pub mod ttl;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CacheResult};
pub use fs::FileSystemContentCache;
pub use janitor::{Janitor, JanitorHandle};
pub use key::{CacheKey, ResultSource, Sample, METADATA_FORMAT};
pub use memory::InMemoryContentCache;
pub use traits::{CacheSink, ContentCache, SweepReport};
pub use ttl::TimeToLive;
