//! Connection handlers.
//!
//! - `job`: a client's compile job, from `JobStart` to response
//! - `objectcache`: HTTP access to cached objects

pub mod job;
pub mod objectcache;
