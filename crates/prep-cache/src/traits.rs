use std::io::{Read, Write};

use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::ttl::TimeToLive;

/// Outcome of one janitor pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Writable handle returned by [`ContentCache::put`].
///
/// Nothing is visible to readers until [`commit`](CacheSink::commit).
/// Dropping a sink without committing discards what was written.
pub trait CacheSink: Write + Send {
    fn commit(self: Box<Self>) -> CacheResult<()>;
}

/// Key to byte-stream cache with expiry and logical eviction.
///
/// Implementations must guarantee:
/// - `has` turns true only through a committed `put`, and turns false once
///   the entry expires or a covering key is evicted.
/// - `evict` never waits on readers; a reader holding an entry keeps
///   reading the bytes it opened.
/// - Read-side I/O failures are logged and reported as a miss.
pub trait ContentCache: Send + Sync {
    /// Whether a live entry exists. Fails only on a key with no step.
    fn has(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Open a live entry for reading.
    fn get(&self, key: &CacheKey) -> CacheResult<Option<Box<dyn Read + Send>>>;

    /// Start writing an entry that expires `ttl` from now.
    ///
    /// Rejects keys without a concrete step id or without a format.
    fn put(&self, key: &CacheKey, ttl: TimeToLive) -> CacheResult<Box<dyn CacheSink>>;

    /// Invalidate the entry, or every entry below a partial key. Returns the
    /// number of entries invalidated.
    fn evict(&self, key: &CacheKey) -> CacheResult<usize>;

    fn clear(&self) -> CacheResult<()>;

    /// Physically delete expired and evicted entries.
    fn sweep(&self) -> SweepReport;

    /// Read a live entry fully into memory.
    fn read_all(&self, key: &CacheKey) -> CacheResult<Option<Vec<u8>>> {
        let Some(mut reader) = self.get(key)? else {
            return Ok(None);
        };
        let mut buf = Vec::new();
        match reader.read_to_end(&mut buf) {
            Ok(_) => Ok(Some(buf)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed reading cache entry");
                Ok(None)
            }
        }
    }

    /// Write and commit `data` in one call.
    fn put_bytes(&self, key: &CacheKey, ttl: TimeToLive, data: &[u8]) -> CacheResult<()> {
        let mut sink = self.put(key, ttl)?;
        sink.write_all(data)?;
        sink.commit()
    }
}
