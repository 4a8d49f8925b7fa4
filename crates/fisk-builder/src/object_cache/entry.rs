//! Cache file format.
//!
//! `[u32 LE header length][JSON header][file contents in index order]`.
//! A file is valid only if its length is exactly
//! `4 + header length + sum(index[].bytes)` and the header digest matches
//! the file name.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use fisk_protocol::JobResponse;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Upper bound accepted for a header when validating.
pub const MAX_HEADER_LEN: u64 = 16 * 1024 * 1024;

/// JSON header of a cache file: the job response plus its source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHeader {
    #[serde(flatten)]
    pub response: JobResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl CacheHeader {
    pub fn new(response: JobResponse, source_file: Option<String>) -> Self {
        Self {
            response,
            source_file,
        }
    }

    pub fn digest(&self) -> &str {
        &self.response.digest
    }

    /// `[u32 LE length][JSON]`.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let json = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(4 + json.len());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// An indexed cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub digest: String,
    pub file_size: u64,
    pub header_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl CacheEntry {
    /// Bytes of file contents after the header.
    pub fn payload_size(&self) -> u64 {
        self.file_size - 4 - self.header_size
    }
}

/// Read and check the header of `path`, which must hold `digest`.
///
/// Returns the header, the entry and the open file positioned at the start
/// of the contents.
pub fn validate(path: &Path, digest: &str) -> Result<(CacheHeader, CacheEntry, File), CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        digest: digest.to_string(),
        reason,
    };

    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut len = [0u8; 4];
    file.read_exact(&mut len).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => corrupt("truncated header length".into()),
        _ => CacheError::Io(e),
    })?;
    let header_size = u32::from_le_bytes(len) as u64;
    if header_size > MAX_HEADER_LEN || 4 + header_size > file_size {
        return Err(corrupt(format!(
            "header length {} does not fit a {} byte file",
            header_size, file_size
        )));
    }

    let mut json = vec![0u8; header_size as usize];
    file.read_exact(&mut json)?;
    let header: CacheHeader =
        serde_json::from_slice(&json).map_err(|e| corrupt(format!("bad header: {}", e)))?;

    if header.digest() != digest {
        return Err(corrupt(format!("header names digest {}", header.digest())));
    }

    let expected = 4 + header_size + header.response.payload_len();
    if expected != file_size {
        return Err(corrupt(format!(
            "file is {} bytes, header accounts for {}",
            file_size, expected
        )));
    }

    let entry = CacheEntry {
        digest: digest.to_string(),
        file_size,
        header_size,
        source_file: header.source_file.clone(),
    };
    Ok((header, entry, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisk_protocol::OutputEntry;
    use std::io::Write;

    fn header(digest: &str, sizes: &[u64]) -> CacheHeader {
        let index = sizes
            .iter()
            .enumerate()
            .map(|(i, &bytes)| OutputEntry {
                path: format!("out{}.o", i),
                bytes,
            })
            .collect();
        CacheHeader::new(
            JobResponse::new(index, 0, digest.to_string(), String::new(), String::new()),
            Some("main.c".into()),
        )
    }

    fn write(path: &Path, header: &CacheHeader, payload: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(&header.encode().unwrap()).unwrap();
        file.write_all(payload).unwrap();
    }

    #[test]
    fn test_header_is_camel_case_and_flat() {
        let value = serde_json::to_value(header("d", &[3])).unwrap();
        assert_eq!(value["digest"], "d");
        assert_eq!(value["sourceFile"], "main.c");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["index"][0]["bytes"], 3);
    }

    #[test]
    fn test_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d1");
        let h = header("d1", &[2, 3]);
        write(&path, &h, b"abcde");

        let (parsed, entry, mut file) = validate(&path, "d1").unwrap();
        assert_eq!(parsed, h);
        assert_eq!(entry.file_size, 4 + entry.header_size + 5);
        assert_eq!(entry.payload_size(), 5);

        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"abcde");
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d1");
        write(&path, &header("d1", &[2, 3]), b"abcd");
        assert!(matches!(validate(&path, "d1"), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_digest_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d2");
        write(&path, &header("d1", &[1]), b"a");
        assert!(matches!(validate(&path, "d2"), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, [0xff, 0xff, 0xff, 0x7f, 1, 2]).unwrap();
        assert!(matches!(validate(&path, "junk"), Err(CacheError::Corrupt { .. })));
        std::fs::write(&path, [1]).unwrap();
        assert!(matches!(validate(&path, "junk"), Err(CacheError::Corrupt { .. })));
    }
}
