//! Merged scheduler configuration and where it came from.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::merge::{merge_layers, toml_to_json};

pub const DEFAULT_PORT: u16 = 8097;
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fisk/scheduler.toml";

/// Scheduler settings after merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Address the listener binds to.
    pub bind: IpAddr,
    pub port: u16,
    /// Directory holding uploaded environments.
    pub root: PathBuf,
    /// Events buffered per monitor before a slow one starts losing them.
    pub monitor_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            root: PathBuf::from("/var/lib/fisk-scheduler"),
            monitor_buffer: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Directory of the environment store.
    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor_buffer == 0 {
            return Err(ConfigError::Invalid("monitor_buffer must be positive".into()));
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// One contributing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// SHA-256 of the file bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// The merged configuration plus its layers in precedence order.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub config: SchedulerConfig,
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Merge defaults, the config file and CLI overrides.
    ///
    /// An explicitly named file must exist; the default path is optional.
    pub fn build(file: Option<&Path>, cli: Option<Value>) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(SchedulerConfig::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut layers = vec![defaults];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        let file = match file {
            Some(path) => Some(path),
            None if default_path.exists() => Some(default_path),
            None => None,
        };
        if let Some(path) = file {
            let (value, digest) = load_toml(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_path_buf()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let config: SchedulerConfig = serde_json::from_value(merge_layers(layers))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(Self { config, sources })
    }
}

fn load_toml(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let parse = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let text = String::from_utf8(bytes).map_err(|e| parse(format!("invalid UTF-8: {}", e)))?;
    let doc: toml::Value = toml::from_str(&text).map_err(|e| parse(e.to_string()))?;
    Ok((toml_to_json(doc), digest))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
