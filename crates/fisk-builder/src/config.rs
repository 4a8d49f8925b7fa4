//! Builder configuration.
//!
//! A TOML file whose missing keys fall back to defaults; `main` applies
//! command-line overrides on top.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fisk_compiler::UserIdentity;
use fisk_protocol::BuilderHeaders;
use serde::{Deserialize, Serialize};

use crate::error::{BuilderError, BuilderResult};

pub const DEFAULT_SCHEDULER: &str = "127.0.0.1:8097";
pub const DEFAULT_PORT: u16 = 8096;
pub const DEFAULT_CACHE_PORT: u16 = 8098;

/// Builder configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Scheduler address, `host:port`.
    pub scheduler: String,
    /// Address the job and cache listeners bind to.
    pub bind: IpAddr,
    /// Job listener port, advertised to the scheduler.
    pub port: u16,
    /// Object cache HTTP port. `None` disables the endpoint.
    pub cache_port: Option<u16>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    /// Platform string matched against environment hosts.
    pub system: String,
    /// Concurrent compile jobs.
    pub slots: u32,
    /// State root holding environments, the object cache and job sandboxes.
    pub root: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub object_cache: ObjectCacheSettings,
    pub isolation: IsolationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectCacheSettings {
    pub enabled: bool,
    /// Bytes that trigger a purge.
    pub max_size: u64,
    /// Bytes a purge brings the cache down to; three quarters of
    /// `max_size` when unset.
    pub purge_size: Option<u64>,
}

impl ObjectCacheSettings {
    pub fn purge_size(&self) -> u64 {
        self.purge_size.unwrap_or(self.max_size / 4 * 3)
    }
}

impl Default for ObjectCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 4 * 1024 * 1024 * 1024,
            purge_size: None,
        }
    }
}

/// Whether compilers run chrooted into their environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationSettings {
    pub enabled: bool,
    /// Unprivileged user to run compilers as.
    pub user: Option<String>,
    /// Group for `user`; its primary group when unset.
    pub group: Option<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            scheduler: DEFAULT_SCHEDULER.to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            cache_port: Some(DEFAULT_CACHE_PORT),
            name: None,
            hostname: None,
            system: std::env::consts::ARCH.to_string(),
            slots: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            root: PathBuf::from("/var/lib/fisk-builder"),
            heartbeat_interval_ms: 1000,
            reconnect_delay_ms: 2000,
            object_cache: ObjectCacheSettings::default(),
            isolation: IsolationSettings::default(),
        }
    }
}

impl BuilderConfig {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> BuilderResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| BuilderError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| BuilderError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> BuilderResult<()> {
        if self.slots == 0 {
            return Err(BuilderError::InvalidConfig("slots must be greater than zero".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(BuilderError::InvalidConfig(
                "heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if self.object_cache.purge_size() > self.object_cache.max_size {
            return Err(BuilderError::InvalidConfig(format!(
                "object_cache.purge_size {} exceeds max_size {}",
                self.object_cache.purge_size(),
                self.object_cache.max_size
            )));
        }
        if self.isolation.user.is_some() && !self.isolation.enabled {
            return Err(BuilderError::InvalidConfig(
                "isolation.user requires isolation.enabled".into(),
            ));
        }
        Ok(())
    }

    /// Packaged environment files.
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Extracted environment roots, one directory per hash.
    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    pub fn object_cache_dir(&self) -> PathBuf {
        self.root.join("objectcache")
    }

    /// Sandboxes of non-isolated jobs.
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Registration headers advertising `environments`.
    pub fn headers(&self, environments: Vec<String>) -> BuilderHeaders {
        BuilderHeaders {
            slots: self.slots,
            port: self.port,
            environments,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            system: Some(self.system.clone()),
            cache_port: self.cache_port,
        }
    }

    /// Resolve the configured compile user.
    #[cfg(unix)]
    pub fn compile_user(&self) -> BuilderResult<Option<UserIdentity>> {
        use nix::unistd::{Group, User};

        let Some(name) = &self.isolation.user else {
            return Ok(None);
        };
        let user = User::from_name(name)
            .ok()
            .flatten()
            .ok_or_else(|| BuilderError::UnknownUser(name.clone()))?;
        let gid = match &self.isolation.group {
            Some(group) => {
                Group::from_name(group)
                    .ok()
                    .flatten()
                    .ok_or_else(|| BuilderError::UnknownGroup(group.clone()))?
                    .gid
            }
            None => user.gid,
        };
        Ok(Some(UserIdentity {
            uid: user.uid.as_raw(),
            gid: gid.as_raw(),
        }))
    }

    #[cfg(not(unix))]
    pub fn compile_user(&self) -> BuilderResult<Option<UserIdentity>> {
        match &self.isolation.user {
            Some(name) => Err(BuilderError::UnknownUser(name.clone())),
            None => Ok(None),
        }
    }
}
