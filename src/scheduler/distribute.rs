//! Environment distribution planning.
//!
//! Each builder receives at most one environment at a time: the first (in
//! hash order) it lacks whose host it can run. It stays busy until it
//! acknowledges its installed set.

use std::collections::{BTreeMap, HashSet};

use fisk_store::Environment;

use super::builder::{BuilderId, BuilderRecord};

/// One environment push to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub builder: BuilderId,
    pub hash: String,
}

/// Choose the next push for every idle builder and mark it busy.
///
/// `failed` holds pairs that were already tried and must not be retried.
pub fn plan(
    builders: &mut BTreeMap<BuilderId, BuilderRecord>,
    environments: &[Environment],
    failed: &HashSet<(BuilderId, String)>,
) -> Vec<Transfer> {
    let mut ordered: Vec<&Environment> = environments.iter().collect();
    ordered.sort_by(|a, b| a.hash.cmp(&b.hash));

    let mut transfers = Vec::new();
    for builder in builders.values_mut() {
        if builder.pending_environments() {
            continue;
        }
        let next = ordered.iter().find(|env| {
            !builder.environments.contains(&env.hash)
                && builder.accepts_host(&env.host)
                && !failed.contains(&(builder.id, env.hash.clone()))
        });
        if let Some(env) = next {
            builder.transfer = Some(env.hash.clone());
            transfers.push(Transfer {
                builder: builder.id,
                hash: env.hash.clone(),
            });
        }
    }
    transfers
}
