//! fisk scheduler.
//!
//! Tracks connected builders and the environments they hold, answers
//! clients asking where to compile, pushes environments to builders that
//! lack them and feeds job activity to monitors.

pub mod config;
pub mod error;
pub mod monitor;
pub mod scheduler;
pub mod server;

pub use config::{ConfigError, EffectiveConfig, SchedulerConfig};
pub use error::{ServerError, ServerResult};
pub use monitor::MonitorFeed;
pub use scheduler::{
    BuilderId, BuilderRecord, PlacementRequest, ReservationId, Scheduler, SchedulerError, Transfer,
};
pub use server::Shared;
