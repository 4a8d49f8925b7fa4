//! Toolchain environment store.
//!
//! Every environment is one self-describing file `<root>/<hash>.env`:
//! `[u32 LE host length][host bytes][tarball payload]`. The host string names
//! the platform the toolchain runs on, so a store can be reloaded from disk
//! without any auxiliary metadata.
//!
//! Features:
//! - Uploads are written under `<root>/.tmp/` and renamed into place once
//!   the declared size has been received
//! - At most one upload per hash is in flight
//! - Disk writes of an upload can run on the blocking pool through the
//!   `*_blocking` variants
//! - A send checks the stored file before announcing it, so a peer never
//!   waits for a payload that cannot be delivered

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use bytes::Bytes;
use fisk_protocol::message::SchedulerMessage;
use fisk_protocol::{ConnectionError, FrameSender, PAYLOAD_CHUNK_SIZE};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// File extension of packaged environments.
pub const ENV_EXTENSION: &str = "env";

/// Upper bound accepted for the host string when parsing a file.
pub const MAX_HOST_LEN: usize = 64 * 1024;

/// Errors from environment store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid environment hash '{0}'")]
    InvalidHash(String),

    #[error("environment '{0}' is already being uploaded")]
    AlreadyPending(String),

    #[error("environment '{0}' not found")]
    NotFound(String),

    #[error("environment '{hash}' received {received} bytes, only {expected} declared")]
    Overflow {
        hash: String,
        expected: u64,
        received: u64,
    },

    #[error("environment '{hash}' incomplete: {written} of {expected} bytes written")]
    Incomplete {
        hash: String,
        expected: u64,
        written: u64,
    },

    #[error("corrupt environment file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),

    /// The `environment` message went out but the payload did not follow
    /// in full. The receiving connection is unusable.
    #[error("transfer of environment '{hash}' interrupted: {source}")]
    Interrupted {
        hash: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A registered environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub hash: String,
    /// Platform string, empty when the uploader did not say.
    pub host: String,
    /// Length of the tarball payload.
    pub bytes: u64,
    pub path: PathBuf,
}

impl Environment {
    /// Offset of the payload inside the packaged file.
    pub fn header_len(&self) -> u64 {
        4 + self.host.len() as u64
    }
}

/// Encode the self-describing header for `host`.
pub fn encode_header(host: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(4 + host.len());
    header.extend_from_slice(&(host.len() as u32).to_le_bytes());
    header.extend_from_slice(host.as_bytes());
    header
}

/// Read the header from the start of a packaged file and return the host.
pub fn read_header<R: Read>(mut reader: R) -> io::Result<String> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_HOST_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("host length {} exceeds {}", len, MAX_HOST_LEN),
        ));
    }
    let mut host = vec![0u8; len];
    reader.read_exact(&mut host)?;
    String::from_utf8(host)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "host is not UTF-8"))
}

/// Hashes become file names; keep them to a safe alphabet.
pub fn validate_hash(hash: &str) -> Result<(), StoreError> {
    let ok = !hash.is_empty()
        && !hash.starts_with('.')
        && hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidHash(hash.to_string()))
    }
}

/// Outcome of [`EnvironmentStore::prepare`].
#[derive(Debug)]
pub enum Prepared {
    /// Already registered; the upload can be skipped.
    AlreadyHave(Environment),
    /// Write the payload through this handle, then call `complete`.
    Write(PendingEnvironment),
}

#[derive(Debug, Default)]
struct Registry {
    environments: BTreeMap<String, Environment>,
    pending: HashSet<String>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An upload in progress.
///
/// Dropping it before `complete` removes the temp file and clears the
/// pending mark.
#[derive(Debug)]
pub struct PendingEnvironment {
    hash: String,
    host: String,
    expected: u64,
    written: u64,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    registry: Arc<Mutex<Registry>>,
}

impl PendingEnvironment {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Payload bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.expected - self.written
    }

    /// Append payload bytes.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let received = self.written + chunk.len() as u64;
        if received > self.expected {
            return Err(StoreError::Overflow {
                hash: self.hash.clone(),
                expected: self.expected,
                received,
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(self.hash.clone()))?;
        writer.write_all(chunk)?;
        self.written = received;
        Ok(())
    }

    /// [`PendingEnvironment::write`] on the blocking pool. On failure the
    /// upload is dropped.
    pub async fn write_blocking(mut self, chunk: Bytes) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || {
            self.write(&chunk)?;
            Ok(self)
        })
        .await?
    }
}

impl Drop for PendingEnvironment {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
        lock(&self.registry).pending.remove(&self.hash);
    }
}

async fn stream_payload(
    env: &Environment,
    file: &mut tokio::fs::File,
    sender: &FrameSender,
) -> Result<(), StoreError> {
    let mut remaining = env.bytes;
    let mut buf = vec![0u8; PAYLOAD_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(PAYLOAD_CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(StoreError::Corrupt {
                path: env.path.clone(),
                reason: format!("payload truncated with {} bytes missing", remaining),
            });
        }
        sender.send_binary(Bytes::copy_from_slice(&buf[..n])).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Store of packaged toolchain environments.
///
/// Clones share the same registry.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    root: PathBuf,
    registry: Arc<Mutex<Registry>>,
}

impl EnvironmentStore {
    /// Open the store at `root`, registering every valid `*.env` file.
    ///
    /// Corrupt files are logged and skipped. Leftover temp files from a
    /// previous run are removed.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let temp_dir = root.join(".tmp");
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }

        let mut registry = Registry::default();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENV_EXTENSION) {
                continue;
            }
            match Self::inspect(&path) {
                Ok(env) => {
                    tracing::debug!(hash = %env.hash, host = %env.host, bytes = env.bytes, "loaded environment");
                    registry.environments.insert(env.hash.clone(), env);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping environment"),
            }
        }

        tracing::info!(
            root = %root.display(),
            count = registry.environments.len(),
            "environment store loaded"
        );

        Ok(Self {
            root,
            registry: Arc::new(Mutex::new(registry)),
        })
    }

    fn inspect(path: &Path) -> Result<Environment, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| corrupt("file name is not UTF-8".into()))?
            .to_string();
        validate_hash(&hash)?;

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let host = read_header(&mut file).map_err(|e| corrupt(e.to_string()))?;

        let header_len = 4 + host.len() as u64;
        Ok(Environment {
            hash,
            host,
            bytes: file_len.saturating_sub(header_len),
            path: path.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn env_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{}.{}", hash, ENV_EXTENSION))
    }

    /// Start an upload of `bytes` payload bytes for `hash`.
    pub fn prepare(&self, hash: &str, host: &str, bytes: u64) -> Result<Prepared, StoreError> {
        validate_hash(hash)?;

        {
            let mut registry = lock(&self.registry);
            if let Some(env) = registry.environments.get(hash) {
                return Ok(Prepared::AlreadyHave(env.clone()));
            }
            if !registry.pending.insert(hash.to_string()) {
                return Err(StoreError::AlreadyPending(hash.to_string()));
            }
        }

        // From here on the pending mark is owned by `pending`; its Drop
        // clears it on every early return.
        let temp_dir = self.root.join(".tmp");
        let temp_path = temp_dir.join(format!(
            "{}.tmp.{}.{}",
            hash,
            std::process::id(),
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        let mut pending = PendingEnvironment {
            hash: hash.to_string(),
            host: host.to_string(),
            expected: bytes,
            written: 0,
            temp_path,
            writer: None,
            registry: Arc::clone(&self.registry),
        };

        fs::create_dir_all(&temp_dir)?;
        let writer = pending
            .writer
            .insert(BufWriter::new(File::create(&pending.temp_path)?));
        writer.write_all(&encode_header(host))?;

        Ok(Prepared::Write(pending))
    }

    /// [`EnvironmentStore::prepare`] on the blocking pool.
    pub async fn prepare_blocking(&self, hash: &str, host: &str, bytes: u64) -> Result<Prepared, StoreError> {
        let store = self.clone();
        let (hash, host) = (hash.to_string(), host.to_string());
        tokio::task::spawn_blocking(move || store.prepare(&hash, &host, bytes)).await?
    }

    /// [`EnvironmentStore::complete`] on the blocking pool.
    pub async fn complete_blocking(&self, pending: PendingEnvironment) -> Result<Environment, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.complete(pending)).await?
    }

    /// Finish an upload: verify the size, rename into place and register.
    pub fn complete(&self, mut pending: PendingEnvironment) -> Result<Environment, StoreError> {
        if pending.written != pending.expected {
            return Err(StoreError::Incomplete {
                hash: pending.hash.clone(),
                expected: pending.expected,
                written: pending.written,
            });
        }

        let writer = pending
            .writer
            .take()
            .ok_or_else(|| StoreError::NotFound(pending.hash.clone()))?;
        let finish = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))
            .and_then(|file| file.sync_all().map_err(StoreError::from));
        let final_path = self.env_path(&pending.hash);
        if let Err(e) = finish.and_then(|_| fs::rename(&pending.temp_path, &final_path).map_err(StoreError::from)) {
            let _ = fs::remove_file(&pending.temp_path);
            return Err(e);
        }

        let env = Environment {
            hash: pending.hash.clone(),
            host: pending.host.clone(),
            bytes: pending.expected,
            path: final_path,
        };
        {
            let mut registry = lock(&self.registry);
            registry.environments.insert(env.hash.clone(), env.clone());
            registry.pending.remove(&env.hash);
        }
        tracing::info!(hash = %env.hash, host = %env.host, bytes = env.bytes, "environment stored");
        Ok(env)
    }

    /// Send `hash` to a peer: an `environment` message followed by the
    /// payload in chunks of at most [`PAYLOAD_CHUNK_SIZE`] bytes.
    ///
    /// Nothing is sent unless the file on disk still holds the registered
    /// payload. A failure after the message went out is reported as
    /// [`StoreError::Interrupted`]. The caller keeps sends to one peer from
    /// overlapping.
    pub async fn send(&self, hash: &str, sender: &FrameSender) -> Result<(), StoreError> {
        let env = self
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))?;

        let mut file = tokio::fs::File::open(&env.path).await?;
        let on_disk = file.metadata().await?.len();
        let expected = env.header_len() + env.bytes;
        if on_disk != expected {
            return Err(StoreError::Corrupt {
                path: env.path.clone(),
                reason: format!("file is {} bytes, {} registered", on_disk, expected),
            });
        }
        file.seek(SeekFrom::Start(env.header_len())).await?;

        sender
            .send_json(&SchedulerMessage::Environment {
                hash: env.hash.clone(),
                host: env.host.clone(),
                bytes: env.bytes,
            })
            .await?;

        stream_payload(&env, &mut file, sender)
            .await
            .map_err(|e| StoreError::Interrupted {
                hash: env.hash.clone(),
                source: Box::new(e),
            })?;

        tracing::debug!(hash = %env.hash, bytes = env.bytes, "environment sent");
        Ok(())
    }

    /// Open the payload of `hash`, positioned after the header.
    pub fn open_payload(&self, hash: &str) -> Result<(Environment, File), StoreError> {
        let env = self
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))?;
        let mut file = File::open(&env.path)?;
        file.seek(SeekFrom::Start(env.header_len()))?;
        Ok((env, file))
    }

    /// Unregister and delete `hash`. Returns false if it was not present.
    pub fn remove(&self, hash: &str) -> Result<bool, StoreError> {
        let removed = lock(&self.registry).environments.remove(hash);
        match removed {
            Some(env) => {
                match fs::remove_file(&env.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tracing::info!(hash = %hash, "environment removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All registered environments, ordered by hash.
    pub fn list(&self) -> Vec<Environment> {
        lock(&self.registry).environments.values().cloned().collect()
    }

    /// Registered hashes, ordered.
    pub fn hashes(&self) -> Vec<String> {
        lock(&self.registry).environments.keys().cloned().collect()
    }

    pub fn contains(&self, hash: &str) -> bool {
        lock(&self.registry).environments.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<Environment> {
        lock(&self.registry).environments.get(hash).cloned()
    }

    /// True while an upload of `hash` is in flight.
    pub fn is_pending(&self, hash: &str) -> bool {
        lock(&self.registry).pending.contains(hash)
    }
}
