//! Typed messages exchanged after the handshake.
//!
//! Messages are JSON objects tagged by `type`. A message that is followed by
//! a binary payload carries the payload length in `bytes`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Who submitted a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Scheduler to builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerMessage {
    /// Environment push; `bytes` of tarball payload follow.
    Environment {
        hash: String,
        host: String,
        bytes: u64,
    },
    /// Remove these environments from the builder.
    DropEnvironments { hashes: Vec<String> },
}

/// Lifecycle report for one job, sent by the builder to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    /// Builder-local job id.
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<u64>,
    pub client: ClientIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub cache_hit: bool,
}

/// Builder to scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuilderMessage {
    /// Full list of installed environments.
    Environments { hashes: Vec<String> },
    JobStarted(JobReport),
    JobFinished(JobReport),
    JobAborted(JobReport),
}

/// Client to scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Ask for another placement on the same connection.
    RequestBuilder {
        environments: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred: Option<String>,
    },
    /// Upload a toolchain tarball; `bytes` of payload follow.
    UploadEnvironment {
        hash: String,
        #[serde(default)]
        host: String,
        bytes: u64,
    },
    /// Delete an environment from the scheduler and every builder.
    DropEnvironment { hash: String },
}

/// Where a client should send its job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub reservation: u64,
    pub builder: u64,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The requested hash that matched.
    pub environment: String,
}

/// Scheduler to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerReply {
    Builder(Placement),
    /// No builder has any of the requested environments.
    NeedsEnvironment { environments: Vec<String> },
    EnvironmentUploaded { hash: String },
    /// `builders` were told to drop `hash`.
    EnvironmentDropped { hash: String, builders: Vec<u64> },
}

/// First message on a job connection; `bytes` of source follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStart {
    pub command_line: Vec<String>,
    pub argv0: String,
    pub bytes: u64,
    /// Wait for a `resume` before sending the source.
    #[serde(default)]
    pub wait: bool,
}

/// One produced file in a job response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub path: String,
    pub bytes: u64,
}

/// Outcome of a job. File contents follow in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub index: Vec<OutputEntry>,
    pub success: bool,
    pub exit_code: i32,
    pub digest: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total payload length, always the sum of `index[].bytes`.
    #[serde(default)]
    pub bytes: u64,
}

impl JobResponse {
    pub fn new(
        index: Vec<OutputEntry>,
        exit_code: i32,
        digest: String,
        stdout: String,
        stderr: String,
    ) -> Self {
        let bytes = index.iter().map(|e| e.bytes).sum();
        Self {
            index,
            success: exit_code == 0,
            exit_code,
            digest,
            stdout,
            stderr,
            error: None,
            bytes,
        }
    }

    /// A response reporting an infrastructure failure.
    pub fn failure(digest: String, exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            index: Vec::new(),
            success: false,
            exit_code,
            digest,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            bytes: 0,
        }
    }

    /// Sum of the declared output sizes.
    pub fn payload_len(&self) -> u64 {
        self.index.iter().map(|e| e.bytes).sum()
    }
}

/// Builder to client on a job connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuilderReply {
    /// Slot acquired, send the source now.
    Resume,
    Heartbeat,
    Response(JobResponse),
}

/// Builder as shown to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderSummary {
    pub id: u64,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub slots: u32,
    pub active_clients: u32,
    pub jobs_performed: u64,
    pub jobs_scheduled: u64,
    pub environments: Vec<String>,
    pub created: DateTime<Utc>,
}

/// Job as shown to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub builder: u64,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<u64>,
    pub client: ClientIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub cache_hit: bool,
    pub time: DateTime<Utc>,
    /// Builder load after the event.
    pub active_clients: u32,
}

/// One-way monitor feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    BuilderAdded { builder: BuilderSummary },
    BuilderRemoved { id: u64 },
    JobStarted { job: JobSummary },
    JobFinished { job: JobSummary },
    JobAborted { job: JobSummary },
}

/// The `type` tag of a message, if any.
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Convert a received JSON message into a typed one.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    let kind = message_type(&value).unwrap_or("<untyped>").to_string();
    serde_json::from_value(value).map_err(|e| ProtocolError::unknown_message(format!("{} ({})", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_push_shape() {
        let msg = SchedulerMessage::Environment {
            hash: "abc".into(),
            host: "Linux x86_64".into(),
            bytes: 12,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "environment", "hash": "abc", "host": "Linux x86_64", "bytes": 12})
        );
    }

    #[test]
    fn test_job_report_tagging() {
        let value = json!({
            "type": "jobFinished",
            "id": 3,
            "reservation": 9,
            "client": {"ip": "10.0.0.2", "name": "laptop"},
            "cacheHit": true
        });
        let msg: BuilderMessage = decode(value).unwrap();
        match msg {
            BuilderMessage::JobFinished(report) => {
                assert_eq!(report.id, 3);
                assert_eq!(report.reservation, Some(9));
                assert!(report.cache_hit);
                assert_eq!(report.client.name.as_deref(), Some("laptop"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_carries_payload_length() {
        let response = JobResponse::new(
            vec![
                OutputEntry { path: "a.o".into(), bytes: 10 },
                OutputEntry { path: "a.gcno".into(), bytes: 20 },
            ],
            0,
            "d1".into(),
            String::new(),
            String::new(),
        );
        let value = serde_json::to_value(BuilderReply::Response(response)).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["bytes"], 30);
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["success"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_job_start_wait_defaults_false() {
        let start: JobStart =
            decode(json!({"commandLine": ["-c", "a.c"], "argv0": "gcc", "bytes": 4})).unwrap();
        assert!(!start.wait);
        assert_eq!(start.command_line, vec!["-c", "a.c"]);
    }

    #[test]
    fn test_unknown_message_type() {
        let err = decode::<ClientMessage>(json!({"type": "teleport"})).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::UnknownMessage);
    }
}
