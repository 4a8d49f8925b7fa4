//! Compile job records.

use chrono::{DateTime, Utc};
use fisk_protocol::{ClientIdentity, JobHeaders, JobReport, JobStart};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::queue::JobId;

/// Lifecycle of a job on this builder.
///
/// `Queued -> (CacheHit | Running) -> Finished | Aborted`, and
/// `Queued -> Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    CacheHit,
    Running,
    Finished,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Aborted)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, CacheHit)
                | (Queued, Running)
                | (Queued, Aborted)
                | (CacheHit, Finished)
                | (CacheHit, Aborted)
                | (Running, Finished)
                | (Running, Aborted)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {id}: digest is already {current}")]
    DigestChanged { id: JobId, current: String },
}

/// Hex SHA-256 over the environment, compiler, arguments and source.
///
/// Each part is length-prefixed so different splits never collide.
pub fn compute_digest(environment: &str, argv0: &str, command_line: &[String], source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    let mut part = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    part(environment.as_bytes());
    part(argv0.as_bytes());
    part(&(command_line.len() as u64).to_le_bytes());
    for arg in command_line {
        part(arg.as_bytes());
    }
    part(source);
    hex::encode(hasher.finalize())
}

/// One compile request.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub client: ClientIdentity,
    pub environment: String,
    pub source_file: Option<String>,
    pub command_line: Vec<String>,
    pub argv0: String,
    pub source_len: u64,
    pub reservation: Option<u64>,
    pub created: DateTime<Utc>,
    digest: Option<String>,
    state: JobState,
    cache_hit: bool,
}

impl Job {
    pub fn new(id: JobId, peer_ip: String, headers: &JobHeaders, start: &JobStart) -> Self {
        Self {
            id,
            client: ClientIdentity {
                ip: peer_ip,
                hostname: headers.hostname.clone(),
                user: headers.user.clone(),
                name: headers.name.clone(),
            },
            environment: headers.environment.clone(),
            source_file: headers.source_file.clone(),
            command_line: start.command_line.clone(),
            argv0: start.argv0.clone(),
            source_len: start.bytes,
            reservation: headers.reservation,
            created: Utc::now(),
            digest: headers.digest.clone(),
            state: JobState::Queued,
            cache_hit: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Record the digest. Setting the same value again is a no-op.
    pub fn set_digest(&mut self, digest: String) -> Result<(), JobError> {
        match &self.digest {
            Some(current) if *current != digest => Err(JobError::DigestChanged {
                id: self.id,
                current: current.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.digest = Some(digest);
                Ok(())
            }
        }
    }

    /// The client's digest, or one computed from the request.
    pub fn ensure_digest(&mut self, source: &[u8]) -> &str {
        let Job {
            digest,
            environment,
            argv0,
            command_line,
            ..
        } = self;
        digest.get_or_insert_with(|| compute_digest(environment, argv0, command_line, source))
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        if next == JobState::CacheHit {
            self.cache_hit = true;
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted` unless already terminal. Returns whether it moved.
    pub fn abort(&mut self) -> bool {
        self.transition(JobState::Aborted).is_ok()
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.id,
            reservation: self.reservation,
            client: self.client.clone(),
            source_file: self.source_file.clone(),
            cache_hit: self.cache_hit,
        }
    }
}
