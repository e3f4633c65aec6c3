//! In-memory cache backend.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::traits::{CacheSink, ContentCache, SweepReport};
use crate::ttl::TimeToLive;

/// Expiry value marking an evicted entry.
const EVICTED: u64 = 0;

#[derive(Clone, Debug)]
struct Entry {
    data: Bytes,
    expires_at: u64,
}

type Entries = Arc<RwLock<BTreeMap<String, Entry>>>;

/// A [`ContentCache`] keeping entries in a sorted map keyed by logical path.
///
/// Readers get a cheap clone of the entry's [`Bytes`], so eviction and
/// sweeping never disturb an open reader.
pub struct InMemoryContentCache {
    entries: Entries,
    clock: Arc<dyn Clock>,
}

impl InMemoryContentCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            clock,
        }
    }

    /// Physical entry count, including expired and evicted entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        let Some(key) = key.resolve_for_read()? else {
            return Ok(None);
        };
        let path = key.path()?;
        let now = self.clock.now_millis();
        let map = self.entries.read().map_err(poisoned)?;
        Ok(map
            .get(&path)
            .filter(|e| e.expires_at > now)
            .map(|e| e.data.clone()))
    }
}

impl Default for InMemoryContentCache {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> CacheError {
    CacheError::LockPoisoned(e.to_string())
}

struct MemorySink {
    entries: Entries,
    path: String,
    expires_at: u64,
    buf: Vec<u8>,
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CacheSink for MemorySink {
    fn commit(self: Box<Self>) -> CacheResult<()> {
        let MemorySink {
            entries,
            path,
            expires_at,
            buf,
        } = *self;
        debug!(key = %path, bytes = buf.len(), "committed cache entry");
        entries.write().map_err(poisoned)?.insert(
            path,
            Entry {
                data: Bytes::from(buf),
                expires_at,
            },
        );
        Ok(())
    }
}

impl ContentCache for InMemoryContentCache {
    fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.live(key)?.is_some())
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Box<dyn Read + Send>>> {
        Ok(self
            .live(key)?
            .map(|data| Box::new(Cursor::new(data)) as Box<dyn Read + Send>))
    }

    fn put(&self, key: &CacheKey, ttl: TimeToLive) -> CacheResult<Box<dyn CacheSink>> {
        key.validate_for_put()?;
        Ok(Box::new(MemorySink {
            entries: Arc::clone(&self.entries),
            path: key.path()?,
            expires_at: ttl.expiry_from(self.clock.now_millis()),
            buf: Vec::new(),
        }))
    }

    fn evict(&self, key: &CacheKey) -> CacheResult<usize> {
        let path = key.path()?;
        let is_entry = key.entry_name()?.is_some();
        let subtree = format!("{path}/");
        let mut map = self.entries.write().map_err(poisoned)?;
        let mut evicted = 0;
        for (entry_path, entry) in map.range_mut(path.clone()..) {
            let covered = if is_entry {
                *entry_path == path
            } else {
                entry_path.starts_with(&subtree)
            };
            if !covered && !entry_path.starts_with(&path) {
                break;
            }
            if covered && entry.expires_at != EVICTED {
                entry.expires_at = EVICTED;
                evicted += 1;
            }
        }
        debug!(key = %path, evicted, "evicted cache entries");
        Ok(evicted)
    }

    fn clear(&self) -> CacheResult<()> {
        self.entries.write().map_err(poisoned)?.clear();
        Ok(())
    }

    fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let collected = self.expired_paths(now);
        let removed = collected.and_then(|(scanned, expired)| {
            self.remove_expired(&expired, now).map(|deleted| (scanned, deleted))
        });
        match removed {
            Ok((scanned, deleted)) => SweepReport {
                scanned,
                deleted,
                failed: 0,
            },
            Err(e) => {
                tracing::warn!(error = %e, "janitor could not sweep memory cache");
                SweepReport {
                    failed: 1,
                    ..SweepReport::default()
                }
            }
        }
    }
}

impl InMemoryContentCache {
    // The sweep scans under the read lock and only takes the write lock to
    // drop what it found, so cache callers wait for removals only.

    /// Entry count and the paths expired at `now`.
    fn expired_paths(&self, now: u64) -> CacheResult<(usize, Vec<String>)> {
        let map = self.entries.read().map_err(poisoned)?;
        let expired = map
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        Ok((map.len(), expired))
    }

    /// Remove `paths` that are still expired; a path re-put since the scan
    /// is kept.
    fn remove_expired(&self, paths: &[String], now: u64) -> CacheResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut map = self.entries.write().map_err(poisoned)?;
        let mut deleted = 0;
        for path in paths {
            if map.get(path).is_some_and(|e| e.expires_at <= now) {
                map.remove(path);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for InMemoryContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryContentCache")
            .field("entries", &self.len())
            .finish()
    }
}
