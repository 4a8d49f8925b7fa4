//! Scheduler service error type.

use std::io;

use fisk_protocol::{ConnectionError, ErrorCode, ProtocolError};
use fisk_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("peer error: {0}")]
    Protocol(ProtocolError),
}

impl ServerError {
    /// The error frame to send before closing the offending connection.
    pub fn to_protocol(&self) -> ProtocolError {
        match self {
            ServerError::Protocol(e) => e.clone(),
            ServerError::Connection(e) => e
                .protocol_error()
                .cloned()
                .unwrap_or_else(|| ProtocolError::new(ErrorCode::Internal, e.to_string())),
            ServerError::Store(e) => {
                ProtocolError::new(ErrorCode::EnvironmentTransferFailed, e.to_string())
            }
            other => ProtocolError::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(error: ProtocolError) -> Self {
        ServerError::Protocol(error)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
