//! Filesystem cache backend.
//!
//! Each entry is one file named `<entry>.<expiry-millis>` in the directory
//! of its step:
//!
//! ```text
//! <root>/datasets/<ds>/preparations/<prep>/steps/<step>/full_json.1718000000000
//! ```
//!
//! Entries are written to a hidden temporary file and renamed into place on
//! commit. Eviction renames a live file to `<name>.0`, which parses as an
//! expiry in the past; the janitor deletes it on its next pass. Open file
//! handles are unaffected by either rename.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::clock::{Clock, SystemClock};
use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::traits::{CacheSink, ContentCache, SweepReport};
use crate::ttl::TimeToLive;

pub struct FileSystemContentCache {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

/// Split `name` into (entry stem, expiry). `None` for files that are not
/// cache entries.
fn parse_entry(name: &str) -> Option<(&str, u64)> {
    if name.starts_with('.') {
        return None;
    }
    let (stem, suffix) = name.rsplit_once('.')?;
    suffix.parse().ok().map(|expiry| (stem, expiry))
}

impl FileSystemContentCache {
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        Self::open_with_clock(root, Arc::new(SystemClock))
    }

    pub fn open_with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, clock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_of(&self, key: &CacheKey) -> CacheResult<PathBuf> {
        Ok(key
            .segments()?
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment)))
    }

    /// Live files for `key`, newest expiry first.
    fn live_files(&self, key: &CacheKey) -> CacheResult<Vec<PathBuf>> {
        let Some(key) = key.resolve_for_read()? else {
            return Ok(Vec::new());
        };
        let Some(entry) = key.entry_name()? else {
            return Ok(Vec::new());
        };
        let dir = self.dir_of(&key)?;
        let now = self.clock.now_millis();

        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cache directory unreadable");
                return Ok(Vec::new());
            }
        };

        let mut live: Vec<(u64, PathBuf)> = listing
            .filter_map(Result::ok)
            .filter_map(|f| {
                let name = f.file_name().to_string_lossy().into_owned();
                match parse_entry(&name) {
                    Some((stem, expiry)) if stem == entry && expiry > now => Some((expiry, f.path())),
                    _ => None,
                }
            })
            .collect();
        live.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(live.into_iter().map(|(_, p)| p).collect())
    }

    fn mark_evicted(path: &Path) -> std::io::Result<()> {
        let mut target = path.as_os_str().to_owned();
        target.push(".0");
        fs::rename(path, PathBuf::from(target))
    }
}

struct FileSink {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl Write for FileSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.tmp.write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.tmp.flush()
    }
}

impl CacheSink for FileSink {
    fn commit(self: Box<Self>) -> CacheResult<()> {
        let FileSink { mut tmp, target } = *self;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        debug!(path = %target.display(), "committed cache entry");
        Ok(())
    }
}

impl ContentCache for FileSystemContentCache {
    fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(!self.live_files(key)?.is_empty())
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Box<dyn Read + Send>>> {
        for path in self.live_files(key)? {
            match File::open(&path) {
                Ok(file) => return Ok(Some(Box::new(file))),
                // Evicted between listing and open.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cache entry unreadable");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn put(&self, key: &CacheKey, ttl: TimeToLive) -> CacheResult<Box<dyn CacheSink>> {
        key.validate_for_put()?;
        let dir = self.dir_of(key)?;
        fs::create_dir_all(&dir)?;
        let entry = key.entry_name()?.unwrap_or_default();
        let expiry = ttl.expiry_from(self.clock.now_millis());
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(".put-");
            b
        };
        let tmp = match builder.tempfile_in(&dir) {
            // The janitor prunes empty directories; recreate once.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&dir)?;
                builder.tempfile_in(&dir)?
            }
            other => other?,
        };
        Ok(Box::new(FileSink {
            tmp,
            target: dir.join(format!("{entry}.{expiry}")),
        }))
    }

    fn evict(&self, key: &CacheKey) -> CacheResult<usize> {
        let dir = self.dir_of(key)?;
        let exact = key.entry_name()?;
        let mut evicted = 0;

        for item in WalkDir::new(&dir).into_iter() {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    if e.io_error().map(|io| io.kind()) != Some(ErrorKind::NotFound) {
                        warn!(dir = %dir.display(), error = %e, "eviction walk failed");
                    }
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let name = item.file_name().to_string_lossy();
            let Some((stem, expiry)) = parse_entry(&name) else {
                continue;
            };
            if expiry == 0 || exact.as_deref().is_some_and(|e| e != stem) {
                continue;
            }
            match Self::mark_evicted(item.path()) {
                Ok(()) => evicted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %item.path().display(), error = %e, "failed to evict entry"),
            }
        }

        debug!(key = %key, evicted, "evicted cache entries");
        Ok(evicted)
    }

    fn clear(&self) -> CacheResult<()> {
        let datasets = self.root.join("datasets");
        match fs::remove_dir_all(&datasets) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let mut report = SweepReport::default();

        for item in WalkDir::new(&self.root).contents_first(true) {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "janitor could not read cache entry");
                    report.failed += 1;
                    continue;
                }
            };
            if item.file_type().is_dir() {
                // Only succeeds for empty directories.
                if item.depth() > 0 {
                    let _ = fs::remove_dir(item.path());
                }
                continue;
            }
            let name = item.file_name().to_string_lossy();
            let Some((_, expiry)) = parse_entry(&name) else {
                continue;
            };
            report.scanned += 1;
            if expiry > now {
                continue;
            }
            match fs::remove_file(item.path()) {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %item.path().display(), error = %e, "janitor failed to delete entry");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for FileSystemContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemContentCache")
            .field("root", &self.root)
            .finish()
    }
}
