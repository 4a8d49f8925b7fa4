//! fisk builder.
//!
//! Runs compile jobs for clients the scheduler sends its way, inside
//! extracted toolchain environments, and keeps a content-addressed cache of
//! the results.
//!
//! This crate can be used in two modes:
//! - **Standalone binary**: `fisk-builder`
//! - **In-process library**: for integration tests that start a builder
//!   on ephemeral ports

pub mod config;
pub mod environments;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod job;
pub mod link;
pub mod object_cache;
pub mod queue;
pub mod server;

pub use config::{BuilderConfig, IsolationSettings, ObjectCacheSettings};
pub use environments::Environments;
pub use error::{BuilderError, BuilderResult};
pub use executor::{Compiled, Executor};
pub use job::{compute_digest, Job, JobError, JobState};
pub use link::SchedulerLink;
pub use object_cache::{CacheError, CacheEvent, CacheInfo, CacheState, ObjectCache};
pub use queue::{Admission, JobId, JobQueue, QueueError, SharedQueue, Slot};
pub use server::{run, serve_jobs, BuilderState};
