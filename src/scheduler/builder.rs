//! Scheduler-side view of a connected builder.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fisk_protocol::{BuilderHeaders, BuilderSummary};

/// Monotonic id assigned when a builder connects.
pub type BuilderId = u64;

/// A connected builder. Lives exactly as long as its connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderRecord {
    pub id: BuilderId,
    pub ip: String,
    /// Job listener port.
    pub port: u16,
    pub hostname: Option<String>,
    pub name: Option<String>,
    /// Platform string matched against environment hosts.
    pub system: Option<String>,
    pub slots: u32,
    /// Placements and jobs not yet finished or aborted.
    pub active_clients: u32,
    pub jobs_performed: u64,
    pub jobs_scheduled: u64,
    pub created: DateTime<Utc>,
    /// Installed environment hashes, as last reported.
    pub environments: BTreeSet<String>,
    /// Environment currently being pushed to this builder.
    pub transfer: Option<String>,
    /// Object cache HTTP port, when the builder serves one.
    pub cache_port: Option<u16>,
}

impl BuilderRecord {
    pub fn new(id: BuilderId, ip: String, headers: &BuilderHeaders) -> Self {
        Self {
            id,
            ip,
            port: headers.port,
            hostname: headers.hostname.clone(),
            name: headers.name.clone(),
            system: headers.system.clone(),
            slots: headers.slots,
            active_clients: 0,
            jobs_performed: 0,
            jobs_scheduled: 0,
            created: Utc::now(),
            environments: headers.environments.iter().cloned().collect(),
            transfer: None,
            cache_port: headers.cache_port,
        }
    }

    /// Spare capacity. Negative once oversubscribed.
    pub fn score(&self) -> i64 {
        i64::from(self.slots) - i64::from(self.active_clients)
    }

    /// True while an environment push is unacknowledged.
    pub fn pending_environments(&self) -> bool {
        self.transfer.is_some()
    }

    /// The first of `wanted` this builder has installed.
    pub fn first_installed<'a>(&self, wanted: &'a [String]) -> Option<&'a str> {
        wanted
            .iter()
            .find(|hash| self.environments.contains(hash.as_str()))
            .map(String::as_str)
    }

    /// Whether `wanted` names this builder by display name or hostname.
    pub fn answers_to(&self, wanted: &str) -> bool {
        self.name.as_deref() == Some(wanted) || self.hostname.as_deref() == Some(wanted)
    }

    /// Environments built for `host` run here. An empty host runs anywhere.
    pub fn accepts_host(&self, host: &str) -> bool {
        host.is_empty() || self.system.as_deref() == Some(host)
    }

    pub fn summary(&self) -> BuilderSummary {
        BuilderSummary {
            id: self.id,
            ip: self.ip.clone(),
            port: self.port,
            hostname: self.hostname.clone(),
            name: self.name.clone(),
            system: self.system.clone(),
            slots: self.slots,
            active_clients: self.active_clients,
            jobs_performed: self.jobs_performed,
            jobs_scheduled: self.jobs_scheduled,
            environments: self.environments.iter().cloned().collect(),
            created: self.created,
        }
    }
}
