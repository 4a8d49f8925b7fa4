//! Content-addressed object cache.
//!
//! Successful job responses are stored as one self-describing file per
//! digest (see [`entry`]) so they can be served to later identical jobs and
//! to other builders over HTTP without auxiliary metadata.
//!
//! ## Lifecycle
//!
//! `None -> Pending -> Exists | None`, and `Exists -> None` on eviction or
//! removal. At most one pending write exists per digest.
//!
//! ## Recency
//!
//! The index is an explicit LRU list. On open, files are indexed in
//! ascending access-time order so eviction follows the previous run's usage
//! before any lookup has happened.

mod entry;
mod events;
mod pending;

pub use entry::{validate, CacheEntry, CacheHeader};
pub use events::{channel, log_events, CacheEvent, CacheEventReceiver, CacheEventSender};
pub use pending::PendingWrite;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix of in-progress cache files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Errors from object cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("header serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    #[error("object {0} is already cached")]
    AlreadyCached(String),

    #[error("object {0} already has a pending write")]
    AlreadyPending(String),

    #[error("object {0} has no pending write")]
    NotPending(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("object {digest}: write exceeds declared size by {excess} bytes")]
    Overflow { digest: String, excess: u64 },

    #[error("object {digest}: {remaining} bytes never written")]
    Incomplete { digest: String, remaining: u64 },

    #[error("object {digest}: expected {expected} bytes on disk, found {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("object {digest} is corrupt: {reason}")]
    Corrupt { digest: String, reason: String },
}

impl CacheError {
    /// True for conditions that indicate a caller bug rather than a
    /// runtime failure.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            CacheError::AlreadyCached(_) | CacheError::AlreadyPending(_) | CacheError::NotPending(_)
        )
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Where a digest currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    None,
    Pending,
    Exists,
}

/// Settings for [`ObjectCache::open`].
#[derive(Debug, Clone)]
pub struct ObjectCacheConfig {
    pub dir: PathBuf,
    /// Size that triggers a purge after a commit.
    pub max_size: u64,
    /// Size a purge brings the cache down to.
    pub purge_size: u64,
}

/// Which listings to include in [`ObjectCache::info`].
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub objects: bool,
    #[serde(default)]
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub digest: String,
    pub expected_size: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub cache_size: u64,
    pub max_size: u64,
    pub purge_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub count: usize,
    /// Most recently used first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<CacheEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<PendingInfo>>,
}

/// Digests become file names; hex and a few separators only.
pub fn is_valid_digest(digest: &str) -> bool {
    !digest.is_empty()
        && digest.len() <= 128
        && digest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// The object cache of one builder.
#[derive(Debug)]
pub struct ObjectCache {
    dir: PathBuf,
    max_size: u64,
    purge_size: u64,
    entries: LruCache<String, CacheEntry>,
    pending: BTreeMap<String, u64>,
    size: u64,
    hits: u64,
    misses: u64,
    events: Option<CacheEventSender>,
}

impl ObjectCache {
    /// Open the cache directory, indexing every valid file.
    ///
    /// Invalid files and leftover temp files are deleted.
    pub fn open(config: ObjectCacheConfig, events: Option<CacheEventSender>) -> CacheResult<Self> {
        fs::create_dir_all(&config.dir)?;

        let mut found: Vec<(SystemTime, CacheEntry)> = Vec::new();
        for dirent in fs::read_dir(&config.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !dirent.file_type()?.is_file() {
                continue;
            }
            if name.ends_with(TEMP_SUFFIX) || !is_valid_digest(&name) {
                tracing::info!(file = %name, "removing stray cache file");
                let _ = fs::remove_file(&path);
                continue;
            }

            // Taken before validation reads the file and bumps its atime.
            let accessed = dirent
                .metadata()
                .and_then(|m| m.accessed())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match entry::validate(&path, &name) {
                Ok((_, entry, _)) => found.push((accessed, entry)),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "removing invalid cache file");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.digest.cmp(&b.1.digest)));

        let mut cache = Self {
            dir: config.dir,
            max_size: config.max_size,
            purge_size: config.purge_size.min(config.max_size),
            entries: LruCache::unbounded(),
            pending: BTreeMap::new(),
            size: 0,
            hits: 0,
            misses: 0,
            events,
        };
        for (_, entry) in found {
            cache.size += entry.file_size;
            cache.entries.put(entry.digest.clone(), entry);
        }

        tracing::info!(
            dir = %cache.dir.display(),
            count = cache.entries.len(),
            size = cache.size,
            max_size = cache.max_size,
            "object cache opened"
        );

        if cache.size > cache.max_size {
            cache.purge(cache.purge_size);
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn object_path(&self, digest: &str) -> PathBuf {
        self.dir.join(digest)
    }

    fn temp_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}{}", digest, TEMP_SUFFIX))
    }

    /// Total bytes of indexed files.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, digest: &str) -> CacheState {
        if self.pending.contains_key(digest) {
            CacheState::Pending
        } else if self.entries.contains(digest) {
            CacheState::Exists
        } else {
            CacheState::None
        }
    }

    /// Digests from least to most recently used.
    pub fn lru_order(&self) -> Vec<String> {
        self.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// Start writing `header` for its digest.
    pub fn begin(&mut self, header: &CacheHeader) -> CacheResult<PendingWrite> {
        let digest = header.digest().to_string();
        if !is_valid_digest(&digest) {
            return Err(CacheError::InvalidDigest(digest));
        }
        match self.state(&digest) {
            CacheState::Exists => return Err(CacheError::AlreadyCached(digest)),
            CacheState::Pending => return Err(CacheError::AlreadyPending(digest)),
            CacheState::None => {}
        }

        let encoded = header.encode()?;
        let pending = PendingWrite::create(
            &digest,
            header.source_file.clone(),
            self.temp_path(&digest),
            &encoded,
            header.response.payload_len(),
        )?;
        self.pending.insert(digest, pending.expected_size());
        Ok(pending)
    }

    /// Verify a finished write and make it visible.
    ///
    /// May trigger a purge down to the purge size, which can evict the new
    /// entry itself when it alone exceeds that size.
    pub fn commit(&mut self, mut pending: PendingWrite) -> CacheResult<CacheEntry> {
        let digest = pending.digest().to_string();
        if self.pending.remove(&digest).is_none() {
            pending.discard();
            return Err(CacheError::NotPending(digest));
        }

        let entry = match self.finalize(&mut pending) {
            Ok(entry) => entry,
            Err(e) => {
                pending.discard();
                return Err(e);
            }
        };

        self.size += entry.file_size;
        self.entries.put(digest.clone(), entry.clone());
        self.emit(CacheEvent::Added {
            digest,
            cache_size: self.size,
            file_size: entry.file_size,
            source_file: entry.source_file.clone(),
        });

        if self.size > self.max_size {
            self.purge(self.purge_size);
        }
        Ok(entry)
    }

    fn finalize(&self, pending: &mut PendingWrite) -> CacheResult<CacheEntry> {
        let digest = pending.digest().to_string();
        if pending.remaining() != 0 {
            return Err(CacheError::Incomplete {
                digest,
                remaining: pending.remaining(),
            });
        }
        pending.finish()?;

        let actual = fs::metadata(pending.temp_path())?.len();
        if actual != pending.expected_size() {
            return Err(CacheError::SizeMismatch {
                digest,
                expected: pending.expected_size(),
                actual,
            });
        }

        fs::rename(pending.temp_path(), self.object_path(&digest))?;
        Ok(CacheEntry {
            digest,
            file_size: actual,
            header_size: pending.header_size(),
            source_file: pending.source_file().map(str::to_string),
        })
    }

    /// Drop a pending write without caching anything.
    pub fn abandon(&mut self, mut pending: PendingWrite) {
        self.pending.remove(pending.digest());
        pending.discard();
    }

    /// Store `header` and its contents in one step.
    pub fn add(&mut self, header: &CacheHeader, contents: &[u8]) -> CacheResult<CacheEntry> {
        let mut pending = self.begin(header)?;
        if let Err(e) = pending.write(contents) {
            self.abandon(pending);
            return Err(e);
        }
        self.commit(pending)
    }

    /// Look up `digest`, counting a hit and marking it most recently used.
    ///
    /// An indexed entry whose file has vanished is evicted and reported as
    /// a miss.
    pub fn get(&mut self, digest: &str) -> Option<CacheEntry> {
        let Some(entry) = self.entries.get(digest).cloned() else {
            self.misses += 1;
            return None;
        };

        if !self.object_path(digest).is_file() {
            tracing::warn!(%digest, "cached object missing on disk, evicting");
            self.remove(digest);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        Some(entry)
    }

    /// Read a validated object from `path`.
    ///
    /// Does not touch the index, so it can run without holding the cache.
    pub fn load_object(path: &Path, digest: &str) -> CacheResult<(CacheHeader, Vec<u8>)> {
        let (header, entry, mut file) = entry::validate(path, digest)?;
        let mut payload = Vec::with_capacity(entry.payload_size() as usize);
        file.read_to_end(&mut payload)?;
        if payload.len() as u64 != entry.payload_size() {
            return Err(CacheError::Corrupt {
                digest: digest.to_string(),
                reason: "file changed while reading".into(),
            });
        }
        Ok((header, payload))
    }

    /// Read the header and contents of a cached object.
    ///
    /// A corrupt object is evicted.
    pub fn read(&mut self, digest: &str) -> CacheResult<(CacheHeader, Vec<u8>)> {
        if !self.entries.contains(digest) {
            return Err(CacheError::NotFound(digest.to_string()));
        }
        match Self::load_object(&self.object_path(digest), digest) {
            Ok(object) => Ok(object),
            Err(e) => {
                tracing::warn!(%digest, error = %e, "evicting unreadable object");
                self.remove(digest);
                Err(e)
            }
        }
    }

    /// Remove `digest` from the index and disk.
    pub fn remove(&mut self, digest: &str) -> bool {
        match self.entries.pop(digest) {
            Some(entry) => {
                self.unlink(entry);
                true
            }
            None => false,
        }
    }

    /// Evict least recently used objects until `size <= target`.
    ///
    /// Returns the evicted digests in eviction order.
    pub fn purge(&mut self, target: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.size > target {
            let Some((digest, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.unlink(entry);
            evicted.push(digest);
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), size = self.size, target, "object cache purged");
        }
        evicted
    }

    fn unlink(&mut self, entry: CacheEntry) {
        if let Err(e) = fs::remove_file(self.object_path(&entry.digest)) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(digest = %entry.digest, error = %e, "failed to delete cached object");
            }
        }
        self.size -= entry.file_size;
        self.emit(CacheEvent::Removed {
            digest: entry.digest,
            cache_size: self.size,
            file_size: entry.file_size,
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Statistics and optional listings.
    pub fn info(&self, query: InfoQuery) -> CacheInfo {
        CacheInfo {
            cache_size: self.size,
            max_size: self.max_size,
            purge_size: self.purge_size,
            hits: self.hits,
            misses: self.misses,
            count: self.entries.len(),
            objects: query
                .objects
                .then(|| self.entries.iter().map(|(_, e)| e.clone()).collect()),
            pending: query.pending.then(|| {
                self.pending
                    .iter()
                    .map(|(digest, &expected_size)| PendingInfo {
                        digest: digest.clone(),
                        expected_size,
                    })
                    .collect()
            }),
        }
    }
}
