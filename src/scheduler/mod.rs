//! Scheduler core.
//!
//! Owns the builder registry, placement reservations and environment
//! distribution state. Every operation is synchronous; the server keeps one
//! [`Scheduler`] behind a mutex and never holds it across an `.await`.
//!
//! Capacity accounting: placement bumps the builder's `active_clients` and
//! `jobs_scheduled` at once. The reservation is released exactly once, by
//! the job's terminal report or by its client going away before the job
//! started. Jobs reported without a known reservation count as load from
//! their start until their terminal report.

mod builder;
mod distribute;
mod placement;
mod reservation;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use fisk_protocol::{BuilderHeaders, BuilderSummary, JobReport, JobSummary, Placement};
use fisk_store::Environment;
use thiserror::Error;

pub use builder::{BuilderId, BuilderRecord};
pub use distribute::Transfer;
pub use placement::{Choice, PlacementRequest};
pub use reservation::{Reservation, ReservationId, ReservationState, Reservations};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown builder {0}")]
    UnknownBuilder(BuilderId),

    #[error("reservation {reservation} belongs to builder {owner}, reported by builder {reporter}")]
    ReservationMismatch {
        reservation: ReservationId,
        owner: BuilderId,
        reporter: BuilderId,
    },

    #[error("builder {builder} reported job {job} started twice")]
    DuplicateJob { builder: BuilderId, job: u64 },

    #[error("builder {builder} ended job {job}, which never started")]
    UnknownJob { builder: BuilderId, job: u64 },
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Aborted,
}

/// A job between its start and terminal report.
#[derive(Debug, Clone, Copy)]
struct RunningJob {
    reservation: Option<ReservationId>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    builders: BTreeMap<BuilderId, BuilderRecord>,
    reservations: Reservations,
    running: HashMap<(BuilderId, u64), RunningJob>,
    failed_transfers: HashSet<(BuilderId, String)>,
    next_builder: BuilderId,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected builder.
    pub fn add_builder(&mut self, ip: String, headers: &BuilderHeaders) -> BuilderId {
        self.next_builder += 1;
        let id = self.next_builder;
        let record = BuilderRecord::new(id, ip, headers);
        tracing::info!(
            builder = id,
            ip = %record.ip,
            port = record.port,
            name = record.name.as_deref().unwrap_or(""),
            slots = record.slots,
            environments = record.environments.len(),
            "builder registered"
        );
        self.builders.insert(id, record);
        id
    }

    /// Forget a disconnected builder. Its reservations are dropped and no
    /// job is moved elsewhere.
    pub fn remove_builder(&mut self, id: BuilderId) -> Option<BuilderRecord> {
        let record = self.builders.remove(&id)?;
        let dropped = self.reservations.drop_builder(id);
        self.running.retain(|(builder, _), _| *builder != id);
        self.failed_transfers.retain(|(builder, _)| *builder != id);
        tracing::info!(
            builder = id,
            reservations = dropped.len(),
            jobs_performed = record.jobs_performed,
            "builder removed"
        );
        Some(record)
    }

    pub fn builder(&self, id: BuilderId) -> Option<&BuilderRecord> {
        self.builders.get(&id)
    }

    /// Builders in id order.
    pub fn builders(&self) -> impl Iterator<Item = &BuilderRecord> {
        self.builders.values()
    }

    pub fn summaries(&self) -> Vec<BuilderSummary> {
        self.builders.values().map(BuilderRecord::summary).collect()
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    /// Choose a builder and reserve one unit of its capacity.
    pub fn place(&mut self, request: &PlacementRequest) -> Option<Placement> {
        let choice = placement::select(&self.builders, request)?;
        let builder = self.builders.get_mut(&choice.builder)?;
        builder.active_clients += 1;
        builder.jobs_scheduled += 1;

        let reservation =
            self.reservations
                .create(builder.id, request.client.clone(), choice.environment.clone());
        tracing::debug!(
            builder = builder.id,
            reservation,
            environment = %choice.environment,
            active_clients = builder.active_clients,
            "placed"
        );
        Some(Placement {
            reservation,
            builder: builder.id,
            ip: builder.ip.clone(),
            port: builder.port,
            hostname: builder.hostname.clone(),
            name: builder.name.clone(),
            environment: choice.environment,
        })
    }

    /// Record that `builder` started a job.
    pub fn job_started(&mut self, builder: BuilderId, report: &JobReport) -> Result<JobSummary, SchedulerError> {
        if !self.builders.contains_key(&builder) {
            return Err(SchedulerError::UnknownBuilder(builder));
        }
        if self.running.contains_key(&(builder, report.id)) {
            return Err(SchedulerError::DuplicateJob {
                builder,
                job: report.id,
            });
        }

        let known = report
            .reservation
            .and_then(|id| self.reservations.get(id).map(|r| (id, r.builder)));
        let reservation = match known {
            Some((id, owner)) if owner != builder => {
                return Err(SchedulerError::ReservationMismatch {
                    reservation: id,
                    owner,
                    reporter: builder,
                })
            }
            Some((id, _)) if self.reservations.start(id) => Some(id),
            _ => None,
        };

        let record = self
            .builders
            .get_mut(&builder)
            .ok_or(SchedulerError::UnknownBuilder(builder))?;
        if reservation.is_none() {
            record.active_clients += 1;
        }
        self.running.insert((builder, report.id), RunningJob { reservation });
        Ok(summary(record, report))
    }

    pub fn job_finished(&mut self, builder: BuilderId, report: &JobReport) -> Result<JobSummary, SchedulerError> {
        self.job_ended(builder, report, Outcome::Finished)
    }

    pub fn job_aborted(&mut self, builder: BuilderId, report: &JobReport) -> Result<JobSummary, SchedulerError> {
        self.job_ended(builder, report, Outcome::Aborted)
    }

    fn job_ended(
        &mut self,
        builder: BuilderId,
        report: &JobReport,
        outcome: Outcome,
    ) -> Result<JobSummary, SchedulerError> {
        if !self.builders.contains_key(&builder) {
            return Err(SchedulerError::UnknownBuilder(builder));
        }

        // Either the job was seen starting, or it ended while its
        // reservation was still unclaimed.
        let ran = match self.running.remove(&(builder, report.id)) {
            Some(job) => {
                if let Some(id) = job.reservation {
                    self.reservations.release(id);
                }
                true
            }
            None => match report
                .reservation
                .and_then(|id| self.reservations.get(id).map(|r| (id, r.builder, r.state)))
            {
                Some((id, owner, ReservationState::Reserved)) if owner == builder => {
                    self.reservations.release(id);
                    false
                }
                _ => {
                    return Err(SchedulerError::UnknownJob {
                        builder,
                        job: report.id,
                    })
                }
            },
        };

        let record = self
            .builders
            .get_mut(&builder)
            .ok_or(SchedulerError::UnknownBuilder(builder))?;
        record.active_clients = record.active_clients.saturating_sub(1);
        if !ran {
            record.jobs_scheduled = record.jobs_scheduled.saturating_sub(1);
        }
        if outcome == Outcome::Finished {
            record.jobs_performed += 1;
        }
        Ok(summary(record, report))
    }

    /// Release reservations whose client disconnected before starting
    /// them. Started ones are left to the builder's terminal report.
    /// Returns the builders whose load changed.
    pub fn client_closed(&mut self, reservations: &[ReservationId]) -> Vec<BuilderId> {
        let mut touched = Vec::new();
        for &id in reservations {
            let unclaimed = matches!(
                self.reservations.get(id),
                Some(r) if r.state == ReservationState::Reserved
            );
            if !unclaimed {
                continue;
            }
            let Some(reservation) = self.reservations.release(id) else {
                continue;
            };
            if let Some(record) = self.builders.get_mut(&reservation.builder) {
                record.active_clients = record.active_clients.saturating_sub(1);
                record.jobs_scheduled = record.jobs_scheduled.saturating_sub(1);
                touched.push(record.id);
            }
        }
        touched
    }

    /// Plan environment pushes for idle builders.
    pub fn plan_transfers(&mut self, environments: &[Environment]) -> Vec<Transfer> {
        distribute::plan(&mut self.builders, environments, &self.failed_transfers)
    }

    /// A builder reported its installed environments.
    ///
    /// Clears the in-flight transfer; a transfer the list does not include
    /// failed and is not retried.
    pub fn environments_ack(&mut self, builder: BuilderId, hashes: Vec<String>) -> Result<(), SchedulerError> {
        let record = self
            .builders
            .get_mut(&builder)
            .ok_or(SchedulerError::UnknownBuilder(builder))?;
        record.environments = hashes.into_iter().collect();
        if let Some(hash) = record.transfer.take() {
            if !record.environments.contains(&hash) {
                tracing::warn!(builder, %hash, "builder did not install pushed environment");
                self.failed_transfers.insert((builder, hash));
            }
        }
        Ok(())
    }

    /// A push could not be delivered.
    pub fn transfer_failed(&mut self, builder: BuilderId, hash: &str) {
        if let Some(record) = self.builders.get_mut(&builder) {
            if record.transfer.as_deref() == Some(hash) {
                record.transfer = None;
            }
            self.failed_transfers.insert((builder, hash.to_string()));
        }
    }

    /// Forget `hash` everywhere and return the builders that had it, which
    /// must be told to drop it.
    pub fn purge_environment(&mut self, hash: &str) -> Vec<BuilderId> {
        self.failed_transfers.retain(|(_, h)| h != hash);
        let mut holders = Vec::new();
        for record in self.builders.values_mut() {
            if record.environments.remove(hash) {
                holders.push(record.id);
            }
            if record.transfer.as_deref() == Some(hash) {
                record.transfer = None;
            }
        }
        holders
    }
}

fn summary(record: &BuilderRecord, report: &JobReport) -> JobSummary {
    JobSummary {
        builder: record.id,
        id: report.id,
        reservation: report.reservation,
        client: report.client.clone(),
        source_file: report.source_file.clone(),
        cache_hit: report.cache_hit,
        time: Utc::now(),
        active_clients: record.active_clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisk_protocol::ClientIdentity;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn headers(slots: u32, envs: &[&str]) -> BuilderHeaders {
        BuilderHeaders {
            slots,
            port: 8096,
            environments: envs.iter().map(|s| s.to_string()).collect(),
            name: None,
            hostname: None,
            system: Some("x86_64".into()),
            cache_port: None,
        }
    }

    fn request(env: &str) -> PlacementRequest {
        PlacementRequest {
            environments: vec![env.to_string()],
            preferred: None,
            client: ClientIdentity {
                ip: "10.1.1.1".into(),
                ..Default::default()
            },
        }
    }

    fn report(id: u64, reservation: Option<ReservationId>) -> JobReport {
        JobReport {
            id,
            reservation,
            client: ClientIdentity::default(),
            source_file: Some("main.c".into()),
            cache_hit: false,
        }
    }

    fn env(hash: &str) -> Environment {
        Environment {
            hash: hash.into(),
            host: String::new(),
            bytes: 1,
            path: PathBuf::from("/dev/null"),
        }
    }

    // =========================================================================
    // Placement scenarios
    // =========================================================================

    #[test]
    fn test_placement_reserves_immediately() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.2".into(), &headers(4, &["abc123"]));

        let placement = scheduler.place(&request("abc123")).unwrap();
        assert_eq!(placement.builder, id);
        assert_eq!(placement.environment, "abc123");
        assert_eq!(placement.ip, "10.0.0.2");

        let record = scheduler.builder(id).unwrap();
        assert_eq!(record.active_clients, 1);
        assert_eq!(record.jobs_scheduled, 1);
    }

    #[test]
    fn test_equal_scores_resolve_to_same_builder() {
        let mut scheduler = Scheduler::new();
        let first = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let second = scheduler.add_builder("10.0.0.2".into(), &headers(2, &["x"]));
        scheduler.builders.get_mut(&first).unwrap().active_clients = 2;
        assert_ne!(first, second);

        for _ in 0..3 {
            let placement = scheduler.place(&request("x")).unwrap();
            assert_eq!(placement.builder, first);
            // Undo so the next request sees identical scores.
            scheduler.client_closed(&[placement.reservation]);
        }
        assert_eq!(scheduler.builder(first).unwrap().active_clients, 2);
    }

    #[test]
    fn test_no_environment_no_placement() {
        let mut scheduler = Scheduler::new();
        scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        assert!(scheduler.place(&request("y")).is_none());
        assert!(scheduler.reservations().is_empty());
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    #[test]
    fn test_reserved_job_lifecycle() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let placement = scheduler.place(&request("x")).unwrap();

        let started = scheduler.job_started(id, &report(1, Some(placement.reservation))).unwrap();
        assert_eq!(started.active_clients, 1);

        // The client closing after start releases nothing.
        assert!(scheduler.client_closed(&[placement.reservation]).is_empty());

        let finished = scheduler.job_finished(id, &report(1, Some(placement.reservation))).unwrap();
        assert_eq!(finished.active_clients, 0);
        let record = scheduler.builder(id).unwrap();
        assert_eq!(record.jobs_performed, 1);
        assert_eq!(record.jobs_scheduled, 1);
        assert!(scheduler.reservations().is_empty());
    }

    #[test]
    fn test_client_close_before_start_releases_once() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let placement = scheduler.place(&request("x")).unwrap();

        assert_eq!(scheduler.client_closed(&[placement.reservation]), vec![id]);
        assert!(scheduler.client_closed(&[placement.reservation]).is_empty());
        let record = scheduler.builder(id).unwrap();
        assert_eq!(record.active_clients, 0);
        assert_eq!(record.jobs_scheduled, 0);
    }

    #[test]
    fn test_abort_before_start_releases_reservation() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let placement = scheduler.place(&request("x")).unwrap();

        scheduler.job_aborted(id, &report(5, Some(placement.reservation))).unwrap();
        let record = scheduler.builder(id).unwrap();
        assert_eq!(record.active_clients, 0);
        assert_eq!(record.jobs_scheduled, 0);
        assert_eq!(record.jobs_performed, 0);
    }

    #[test]
    fn test_direct_job_counts_while_running() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));

        scheduler.job_started(id, &report(1, None)).unwrap();
        assert_eq!(scheduler.builder(id).unwrap().active_clients, 1);
        assert_eq!(
            scheduler.job_started(id, &report(1, None)),
            Err(SchedulerError::DuplicateJob { builder: id, job: 1 })
        );
        scheduler.job_finished(id, &report(1, None)).unwrap();
        assert_eq!(scheduler.builder(id).unwrap().active_clients, 0);
        assert_eq!(
            scheduler.job_finished(id, &report(1, None)),
            Err(SchedulerError::UnknownJob { builder: id, job: 1 })
        );
    }

    #[test]
    fn test_reservation_reported_by_wrong_builder() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let b = scheduler.add_builder("10.0.0.2".into(), &headers(1, &["y"]));
        let placement = scheduler.place(&request("x")).unwrap();

        let err = scheduler.job_started(b, &report(1, Some(placement.reservation))).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::ReservationMismatch {
                reservation: placement.reservation,
                owner: a,
                reporter: b
            }
        );
    }

    #[test]
    fn test_remove_builder_drops_reservations() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x"]));
        let placement = scheduler.place(&request("x")).unwrap();
        scheduler.job_started(id, &report(1, Some(placement.reservation))).unwrap();

        assert!(scheduler.remove_builder(id).is_some());
        assert!(scheduler.remove_builder(id).is_none());
        assert!(scheduler.reservations().is_empty());
        assert!(scheduler.place(&request("x")).is_none());
        assert_eq!(
            scheduler.job_finished(id, &report(1, None)),
            Err(SchedulerError::UnknownBuilder(id))
        );
    }

    // =========================================================================
    // Environment distribution
    // =========================================================================

    #[test]
    fn test_ack_clears_transfer_and_records_failure() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &[]));
        let envs = vec![env("a"), env("b")];

        let plan = scheduler.plan_transfers(&envs);
        assert_eq!(plan, vec![Transfer { builder: id, hash: "a".into() }]);

        scheduler.environments_ack(id, vec!["a".into()]).unwrap();
        let plan = scheduler.plan_transfers(&envs);
        assert_eq!(plan, vec![Transfer { builder: id, hash: "b".into() }]);

        // "b" never shows up: not pushed again.
        scheduler.environments_ack(id, vec!["a".into()]).unwrap();
        assert!(scheduler.plan_transfers(&envs).is_empty());
    }

    #[test]
    fn test_transfer_failed_frees_builder() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_builder("10.0.0.1".into(), &headers(4, &[]));
        let envs = vec![env("a"), env("b")];
        scheduler.plan_transfers(&envs);

        scheduler.transfer_failed(id, "a");
        assert!(!scheduler.builder(id).unwrap().pending_environments());
        assert_eq!(
            scheduler.plan_transfers(&envs),
            vec![Transfer { builder: id, hash: "b".into() }]
        );
    }

    #[test]
    fn test_purge_environment() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.add_builder("10.0.0.1".into(), &headers(4, &["x", "y"]));
        scheduler.add_builder("10.0.0.2".into(), &headers(4, &["y"]));
        let c = scheduler.add_builder("10.0.0.3".into(), &headers(4, &["x"]));

        assert_eq!(scheduler.purge_environment("x"), vec![a, c]);
        assert!(scheduler.place(&request("x")).is_none());
        assert!(scheduler.purge_environment("x").is_empty());
    }

    // =========================================================================
    // Capacity balance
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Place,
        Start(usize),
        Finish(usize),
        Abort(usize),
        Close(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Place),
            (0usize..32).prop_map(Op::Start),
            (0usize..32).prop_map(Op::Finish),
            (0usize..32).prop_map(Op::Abort),
            (0usize..32).prop_map(Op::Close),
        ]
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Phase {
        Placed,
        Running,
        Done,
    }

    proptest! {
        #[test]
        fn prop_active_clients_match_jobs_in_flight(ops in prop::collection::vec(op(), 1..80)) {
            let mut scheduler = Scheduler::new();
            let ids = [
                scheduler.add_builder("10.0.0.1".into(), &headers(3, &["x"])),
                scheduler.add_builder("10.0.0.2".into(), &headers(5, &["x"])),
            ];
            // (builder, reservation, phase) per placement, job id = index.
            let mut jobs: Vec<(BuilderId, ReservationId, Phase)> = Vec::new();

            for op in ops {
                match op {
                    Op::Place => {
                        let p = scheduler.place(&request("x")).unwrap();
                        jobs.push((p.builder, p.reservation, Phase::Placed));
                    }
                    Op::Start(i) if i < jobs.len() && jobs[i].2 == Phase::Placed => {
                        let (b, r, _) = jobs[i];
                        scheduler.job_started(b, &report(i as u64, Some(r))).unwrap();
                        jobs[i].2 = Phase::Running;
                    }
                    Op::Finish(i) if i < jobs.len() && jobs[i].2 == Phase::Running => {
                        let (b, r, _) = jobs[i];
                        scheduler.job_finished(b, &report(i as u64, Some(r))).unwrap();
                        jobs[i].2 = Phase::Done;
                    }
                    Op::Abort(i) if i < jobs.len() && jobs[i].2 != Phase::Done => {
                        let (b, r, _) = jobs[i];
                        scheduler.job_aborted(b, &report(i as u64, Some(r))).unwrap();
                        jobs[i].2 = Phase::Done;
                    }
                    Op::Close(i) if i < jobs.len() => {
                        let (_, r, phase) = jobs[i];
                        scheduler.client_closed(&[r]);
                        if phase == Phase::Placed {
                            jobs[i].2 = Phase::Done;
                        }
                    }
                    _ => {}
                }

                for &b in &ids {
                    let in_flight = jobs.iter().filter(|j| j.0 == b && j.2 != Phase::Done).count();
                    prop_assert_eq!(scheduler.builder(b).unwrap().active_clients as usize, in_flight);
                }
            }
            prop_assert_eq!(
                scheduler.reservations().len(),
                jobs.iter().filter(|j| j.2 != Phase::Done).count()
            );
        }
    }
}
