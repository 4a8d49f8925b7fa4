//! In-progress cache writes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::CacheError;

/// A cache file being written under `<digest>.tmp`.
///
/// Invisible to lookups until committed. Dropping it removes the temp file;
/// the owning cache still has to be told through `commit` or `abandon`.
#[derive(Debug)]
pub struct PendingWrite {
    digest: String,
    source_file: Option<String>,
    remaining: u64,
    header_size: u64,
    expected_size: u64,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl PendingWrite {
    pub(super) fn create(
        digest: &str,
        source_file: Option<String>,
        temp_path: PathBuf,
        header: &[u8],
        payload_len: u64,
    ) -> Result<Self, CacheError> {
        let mut pending = Self {
            digest: digest.to_string(),
            source_file,
            remaining: payload_len,
            header_size: header.len() as u64 - 4,
            expected_size: header.len() as u64 + payload_len,
            temp_path,
            writer: None,
        };
        let writer = pending
            .writer
            .insert(BufWriter::new(File::create(&pending.temp_path)?));
        writer.write_all(header)?;
        Ok(pending)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    /// Content bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Length of the JSON header, without its length prefix.
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Final file size once complete.
    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub(super) fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Append file contents.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        let len = chunk.len() as u64;
        if len > self.remaining {
            return Err(CacheError::Overflow {
                digest: self.digest.clone(),
                excess: len - self.remaining,
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CacheError::NotPending(self.digest.clone()))?;
        writer.write_all(chunk)?;
        self.remaining -= len;
        Ok(())
    }

    /// Flush and close the temp file, leaving it on disk.
    pub(super) fn finish(&mut self) -> Result<(), CacheError> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| CacheError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Delete the temp file.
    pub(super) fn discard(&mut self) {
        self.writer = None;
        let _ = fs::remove_file(&self.temp_path);
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.discard();
        }
    }
}
