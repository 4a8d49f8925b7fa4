//! On-disk state for fisk nodes.

pub mod environment;
pub mod version;

pub use environment::{Environment, EnvironmentStore, PendingEnvironment, Prepared, StoreError};
pub use version::{ensure_version, VersionCheck};

/// Version stamped into every state root. Bump when an on-disk format
/// changes.
pub const STATE_VERSION: &str = "1";
