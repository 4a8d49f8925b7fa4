//! Error types carried in error frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error codes sent to peers in error frames.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed JSON or a message that does not fit the connection role.
    InvalidRequest,
    /// A required handshake header is absent.
    MissingHeader,
    /// A handshake header is present but malformed.
    InvalidHeader,
    /// Peer speaks a different protocol version.
    UnsupportedProtocol,
    /// Framing rules were broken (unexpected binary data, length mismatch).
    ProtocolViolation,
    /// Unknown message type for this connection role.
    UnknownMessage,
    /// The requested environment is not installed on this node.
    EnvironmentMissing,
    /// An environment upload or push could not be stored.
    EnvironmentTransferFailed,
    /// The compile request itself is unusable (bad command line).
    InvalidJob,
    /// Internal failure on the remote side.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::MissingHeader => write!(f, "MISSING_HEADER"),
            Self::InvalidHeader => write!(f, "INVALID_HEADER"),
            Self::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            Self::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            Self::UnknownMessage => write!(f, "UNKNOWN_MESSAGE"),
            Self::EnvironmentMissing => write!(f, "ENVIRONMENT_MISSING"),
            Self::EnvironmentTransferFailed => write!(f, "ENVIRONMENT_TRANSFER_FAILED"),
            Self::InvalidJob => write!(f, "INVALID_JOB"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Structured error sent to a peer before a connection is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message. Never a stack trace.
    pub message: String,
    /// Optional machine-readable details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    /// Create a new protocol error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new protocol error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a PROTOCOL_VIOLATION error.
    pub fn violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    /// Create a MISSING_HEADER error.
    pub fn missing_header(name: &str) -> Self {
        Self::with_data(
            ErrorCode::MissingHeader,
            format!("required header '{}' is missing", name),
            serde_json::json!({ "header": name }),
        )
    }

    /// Create an INVALID_HEADER error.
    pub fn invalid_header(name: &str, value: &str, reason: &str) -> Self {
        Self::with_data(
            ErrorCode::InvalidHeader,
            format!("header '{}' is invalid: {}", name, reason),
            serde_json::json!({ "header": name, "value": value }),
        )
    }

    /// Create an UNSUPPORTED_PROTOCOL error.
    pub fn unsupported_protocol(requested: u32, supported: u32) -> Self {
        Self::with_data(
            ErrorCode::UnsupportedProtocol,
            format!(
                "protocol version {} is not supported (expected {})",
                requested, supported
            ),
            serde_json::json!({ "requested": requested, "supported": supported }),
        )
    }

    /// Create an UNKNOWN_MESSAGE error.
    pub fn unknown_message(detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnknownMessage,
            format!("unexpected message: {}", detail),
        )
    }

    /// Create an ENVIRONMENT_MISSING error.
    pub fn environment_missing(hash: &str) -> Self {
        Self::with_data(
            ErrorCode::EnvironmentMissing,
            format!("environment '{}' is not installed", hash),
            serde_json::json!({ "hash": hash }),
        )
    }

    /// Serialize into the JSON body of an error frame.
    pub fn to_frame(&self) -> Value {
        let mut frame = serde_json::json!({
            "type": "error",
            "code": self.code,
            "message": self.message,
        });
        if let Some(data) = &self.data {
            frame["data"] = data.clone();
        }
        frame
    }

    /// Recognize an error frame received from a peer.
    pub fn from_frame(value: &Value) -> Option<Self> {
        if value.get("type").and_then(Value::as_str) != Some("error") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}
