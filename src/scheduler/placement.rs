//! Builder selection.
//!
//! Candidates are builders with at least one of the requested environments
//! installed. Each scores `slots - active_clients`; the highest score wins
//! and ties go to the lowest builder id. A preferred builder wins outright
//! when it is a candidate with spare capacity.

use std::collections::BTreeMap;

use fisk_protocol::ClientIdentity;

use super::builder::{BuilderId, BuilderRecord};

/// A client's request for somewhere to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    /// Acceptable environment hashes, most preferred first.
    pub environments: Vec<String>,
    /// Builder name or hostname to use if possible.
    pub preferred: Option<String>,
    pub client: ClientIdentity,
}

/// The chosen builder and the requested hash it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub builder: BuilderId,
    pub environment: String,
}

/// Pick a builder for `request`, or `None` when no builder has any of the
/// requested environments.
pub fn select(builders: &BTreeMap<BuilderId, BuilderRecord>, request: &PlacementRequest) -> Option<Choice> {
    let candidates = builders
        .values()
        .filter_map(|b| b.first_installed(&request.environments).map(|env| (b, env)));

    let mut best: Option<(&BuilderRecord, &str)> = None;
    for (builder, env) in candidates {
        if let Some(wanted) = request.preferred.as_deref() {
            if builder.answers_to(wanted) && builder.score() > 0 {
                best = Some((builder, env));
                break;
            }
        }
        // Ascending ids: only a strictly better score displaces.
        match best {
            Some((current, _)) if builder.score() <= current.score() => {}
            _ => best = Some((builder, env)),
        }
    }

    best.map(|(builder, env)| Choice {
        builder: builder.id,
        environment: env.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisk_protocol::BuilderHeaders;
    use proptest::prelude::*;

    fn builder(id: BuilderId, slots: u32, active: u32, envs: &[&str]) -> BuilderRecord {
        let mut record = BuilderRecord::new(
            id,
            format!("10.0.0.{}", id),
            &BuilderHeaders {
                slots,
                port: 8096,
                environments: envs.iter().map(|s| s.to_string()).collect(),
                name: Some(format!("b{}", id)),
                hostname: None,
                system: None,
                cache_port: None,
            },
        );
        record.active_clients = active;
        record
    }

    fn registry(records: Vec<BuilderRecord>) -> BTreeMap<BuilderId, BuilderRecord> {
        records.into_iter().map(|r| (r.id, r)).collect()
    }

    fn request(envs: &[&str]) -> PlacementRequest {
        PlacementRequest {
            environments: envs.iter().map(|s| s.to_string()).collect(),
            preferred: None,
            client: ClientIdentity::default(),
        }
    }

    #[test]
    fn test_highest_score_wins() {
        let builders = registry(vec![builder(1, 4, 3, &["x"]), builder(2, 4, 1, &["x"])]);
        assert_eq!(select(&builders, &request(&["x"])).unwrap().builder, 2);
    }

    #[test]
    fn test_builder_without_environment_never_chosen() {
        let builders = registry(vec![builder(1, 64, 0, &["y"]), builder(2, 1, 5, &["x"])]);
        let choice = select(&builders, &request(&["x"])).unwrap();
        assert_eq!(choice.builder, 2);
        assert_eq!(choice.environment, "x");
    }

    #[test]
    fn test_no_candidates() {
        let builders = registry(vec![builder(1, 4, 0, &["y"])]);
        assert_eq!(select(&builders, &request(&["x"])), None);
        assert_eq!(select(&BTreeMap::new(), &request(&["x"])), None);
    }

    #[test]
    fn test_tie_goes_to_lowest_id() {
        let builders = registry(vec![builder(7, 4, 2, &["x"]), builder(3, 2, 0, &["x"])]);
        for _ in 0..5 {
            assert_eq!(select(&builders, &request(&["x"])).unwrap().builder, 3);
        }
    }

    #[test]
    fn test_matched_environment_follows_request_order() {
        let builders = registry(vec![builder(1, 4, 0, &["old", "new"])]);
        let choice = select(&builders, &request(&["new", "old"])).unwrap();
        assert_eq!(choice.environment, "new");
    }

    #[test]
    fn test_preferred_builder_with_capacity() {
        let builders = registry(vec![builder(1, 8, 0, &["x"]), builder(2, 2, 1, &["x"])]);
        let mut req = request(&["x"]);
        req.preferred = Some("b2".into());
        assert_eq!(select(&builders, &req).unwrap().builder, 2);

        // A full preferred builder falls back to scoring.
        let builders = registry(vec![builder(1, 8, 0, &["x"]), builder(2, 2, 2, &["x"])]);
        assert_eq!(select(&builders, &req).unwrap().builder, 1);
    }

    proptest! {
        #[test]
        fn prop_choice_has_maximal_score(
            specs in prop::collection::vec((1u32..16, 0u32..20, any::<bool>()), 0..12)
        ) {
            let records: Vec<BuilderRecord> = specs
                .iter()
                .enumerate()
                .map(|(i, &(slots, active, has))| {
                    builder(i as u64 + 1, slots, active, if has { &["x"] } else { &["other"] })
                })
                .collect();
            let builders = registry(records);
            let choice = select(&builders, &request(&["x"]));

            let eligible: Vec<&BuilderRecord> = builders
                .values()
                .filter(|b| b.environments.contains("x"))
                .collect();
            match choice {
                None => prop_assert!(eligible.is_empty()),
                Some(choice) => {
                    let chosen = &builders[&choice.builder];
                    prop_assert!(chosen.environments.contains("x"));
                    let max = eligible.iter().map(|b| b.score()).max().unwrap();
                    prop_assert_eq!(chosen.score(), max);
                    let first = eligible.iter().find(|b| b.score() == max).unwrap();
                    prop_assert_eq!(chosen.id, first.id);
                }
            }
        }
    }
}
