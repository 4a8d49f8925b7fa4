//! Installed toolchain environments.
//!
//! Packaged tarballs live in the [`EnvironmentStore`]; each one is also
//! extracted to `<environments>/<hash>/` so compilers can be chrooted into
//! it. Extraction happens in a sibling temp directory that is renamed into
//! place, so an existing directory is always a complete extraction.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use fisk_protocol::Connection;
use fisk_store::{Environment, EnvironmentStore, Prepared};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{BuilderError, BuilderResult};

#[derive(Debug)]
pub struct Environments {
    store: EnvironmentStore,
    extract_root: PathBuf,
}

impl Environments {
    /// Load the package store. Call [`Environments::extract_missing`]
    /// before serving jobs.
    pub fn open(packages: &Path, extract_root: &Path) -> BuilderResult<Self> {
        let store = EnvironmentStore::load(packages)?;
        fs::create_dir_all(extract_root)?;
        for dirent in fs::read_dir(extract_root)? {
            let path = dirent?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if stale {
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(Self {
            store,
            extract_root: extract_root.to_path_buf(),
        })
    }

    pub fn store(&self) -> &EnvironmentStore {
        &self.store
    }

    /// Installed hashes, ordered.
    pub fn hashes(&self) -> Vec<String> {
        self.store.hashes()
    }

    pub fn root_of(&self, hash: &str) -> PathBuf {
        self.extract_root.join(hash)
    }

    /// True when `hash` is stored and extracted.
    pub fn is_ready(&self, hash: &str) -> bool {
        self.store.contains(hash) && self.root_of(hash).is_dir()
    }

    /// Redo extractions lost since the packages were stored. Environments
    /// that fail to extract are removed.
    pub async fn extract_missing(&self) {
        for env in self.store.list() {
            if self.root_of(&env.hash).is_dir() {
                continue;
            }
            tracing::info!(hash = %env.hash, "extracting environment");
            if let Err(e) = self.extract(&env.hash).await {
                tracing::warn!(hash = %env.hash, error = %e, "dropping environment that failed to extract");
                let _ = self.store.remove(&env.hash);
            }
        }
    }

    /// Store the payload announced by an `environment` message and extract
    /// it. The whole payload is consumed even when it is not needed.
    pub async fn receive(
        &self,
        conn: &mut Connection,
        hash: &str,
        host: &str,
        bytes: u64,
    ) -> BuilderResult<Environment> {
        let prepared = match self.store.prepare_blocking(hash, host, bytes).await {
            Ok(prepared) => prepared,
            Err(e) => {
                drain(conn, bytes).await?;
                return Err(e.into());
            }
        };

        let env = match prepared {
            Prepared::AlreadyHave(env) => {
                drain(conn, bytes).await?;
                env
            }
            Prepared::Write(mut pending) => {
                let mut remaining = bytes;
                while remaining > 0 {
                    let (data, last) = conn.recv_data().await?;
                    remaining = remaining.saturating_sub(data.len() as u64);
                    pending = match pending.write_blocking(data).await {
                        Ok(pending) => pending,
                        Err(e) => {
                            if !last {
                                drain(conn, remaining).await?;
                            }
                            return Err(e.into());
                        }
                    };
                    if last {
                        break;
                    }
                }
                self.store.complete_blocking(pending).await?
            }
        };

        if !tokio::fs::metadata(self.root_of(hash)).await.is_ok_and(|m| m.is_dir()) {
            if let Err(e) = self.extract(hash).await {
                let _ = self.store.remove(hash);
                return Err(e);
            }
        }
        Ok(env)
    }

    /// Unpack the stored tarball of `hash` with `tar -xzf -`.
    pub async fn extract(&self, hash: &str) -> BuilderResult<PathBuf> {
        let target = self.root_of(hash);
        let staging = self.extract_root.join(format!(".{}.{}", hash, std::process::id()));
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let mut result = self.untar(hash, &staging).await;
        if result.is_ok() {
            result = tokio::fs::rename(&staging, &target).await.map_err(BuilderError::from);
        }
        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }
        tracing::info!(%hash, root = %target.display(), "environment extracted");
        Ok(target)
    }

    async fn untar(&self, hash: &str, dir: &Path) -> BuilderResult<()> {
        let failed = |reason: String| BuilderError::Extraction {
            hash: hash.to_string(),
            reason,
        };

        let (_, payload) = self.store.open_payload(hash)?;
        let mut child = Command::new("tar")
            .arg("-xzf")
            .arg("-")
            .arg("-C")
            .arg(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot run tar: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| failed("tar has no stdin".into()))?;
        let mut payload = tokio::fs::File::from_std(payload);
        let copied = tokio::io::copy(&mut payload, &mut stdin).await;
        drop(stdin);

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(failed(format!("tar exited with {}: {}", status, stderr.trim())));
        }
        copied.map_err(|e| failed(format!("writing to tar: {}", e)))?;
        Ok(())
    }

    /// Forget `hash`: delete its package and extracted root.
    pub async fn remove(&self, hash: &str) -> BuilderResult<bool> {
        let removed = self.store.remove(hash)?;
        let root = self.root_of(hash);
        if tokio::fs::try_exists(&root).await? {
            tokio::fs::remove_dir_all(&root).await?;
        }
        Ok(removed)
    }
}

/// Read and discard `bytes` of payload.
async fn drain(conn: &mut Connection, bytes: u64) -> BuilderResult<()> {
    if bytes == 0 {
        return Ok(());
    }
    loop {
        let (_, last) = conn.recv_data().await?;
        if last {
            return Ok(());
        }
    }
}
