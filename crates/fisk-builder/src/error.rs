//! Builder error type.

use std::io;
use std::path::PathBuf;

use fisk_compiler::{ArgumentError, ProcessError};
use fisk_protocol::{ConnectionError, ProtocolError};
use fisk_store::StoreError;
use thiserror::Error;

use crate::job::JobError;
use crate::object_cache::CacheError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Arguments(#[from] ArgumentError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("environment {0} is not installed")]
    EnvironmentMissing(String),

    #[error("extracting environment {hash} failed: {reason}")]
    Extraction { hash: String, reason: String },

    #[error("peer error: {0}")]
    Protocol(ProtocolError),
}

impl BuilderError {
    /// The error frame a job client should see for this failure.
    pub fn to_protocol(&self) -> ProtocolError {
        use fisk_protocol::ErrorCode;
        match self {
            BuilderError::Protocol(e) => e.clone(),
            BuilderError::Connection(e) => e
                .protocol_error()
                .cloned()
                .unwrap_or_else(|| ProtocolError::new(ErrorCode::Internal, e.to_string())),
            BuilderError::Arguments(e) => ProtocolError::new(ErrorCode::InvalidJob, e.to_string()),
            BuilderError::EnvironmentMissing(hash) => ProtocolError::environment_missing(hash),
            BuilderError::Store(e) => {
                ProtocolError::new(ErrorCode::EnvironmentTransferFailed, e.to_string())
            }
            other => ProtocolError::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

pub type BuilderResult<T> = Result<T, BuilderError>;
