//! Scheduler configuration.
//!
//! Three layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, else `/etc/fisk/scheduler.toml` when present)
//! 3. Command-line flags

mod effective;
mod merge;

pub use effective::{
    ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, SchedulerConfig,
    DEFAULT_CONFIG_PATH, DEFAULT_PORT,
};
pub use merge::{deep_merge, merge_layers, toml_to_json};
