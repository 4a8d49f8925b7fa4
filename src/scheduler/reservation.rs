//! Capacity reserved by placement until the job ends.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fisk_protocol::ClientIdentity;

use super::builder::BuilderId;

pub type ReservationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// Placed; the client has not started the job yet.
    Reserved,
    /// The builder reported the job started.
    Started,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: ReservationId,
    pub builder: BuilderId,
    pub client: ClientIdentity,
    pub environment: String,
    pub state: ReservationState,
    pub created: DateTime<Utc>,
}

/// Live reservations. A released reservation leaves the table, so release
/// happens at most once.
#[derive(Debug, Default)]
pub struct Reservations {
    next: ReservationId,
    live: HashMap<ReservationId, Reservation>,
}

impl Reservations {
    pub fn create(&mut self, builder: BuilderId, client: ClientIdentity, environment: String) -> ReservationId {
        self.next += 1;
        let id = self.next;
        self.live.insert(
            id,
            Reservation {
                id,
                builder,
                client,
                environment,
                state: ReservationState::Reserved,
                created: Utc::now(),
            },
        );
        id
    }

    pub fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.live.get(&id)
    }

    /// Move `id` from `Reserved` to `Started`. False if it is not reserved.
    pub fn start(&mut self, id: ReservationId) -> bool {
        match self.live.get_mut(&id) {
            Some(reservation) if reservation.state == ReservationState::Reserved => {
                reservation.state = ReservationState::Started;
                true
            }
            _ => false,
        }
    }

    /// Remove `id`, returning it with the state it had.
    pub fn release(&mut self, id: ReservationId) -> Option<Reservation> {
        self.live.remove(&id)
    }

    /// Remove every reservation on `builder`.
    pub fn drop_builder(&mut self, builder: BuilderId) -> Vec<Reservation> {
        let ids: Vec<ReservationId> = self
            .live
            .values()
            .filter(|r| r.builder == builder)
            .map(|r| r.id)
            .collect();
        ids.into_iter().filter_map(|id| self.live.remove(&id)).collect()
    }

    /// Live reservations on `builder`.
    pub fn count_for(&self, builder: BuilderId) -> usize {
        self.live.values().filter(|r| r.builder == builder).count()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut table = Reservations::default();
        let id = table.create(1, ClientIdentity::default(), "e".into());
        assert_eq!(id, 1);
        assert!(table.start(id));
        assert!(!table.start(id));
        assert_eq!(table.release(id).map(|r| r.state), Some(ReservationState::Started));
        assert!(table.release(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_drop_builder() {
        let mut table = Reservations::default();
        table.create(1, ClientIdentity::default(), "e".into());
        table.create(2, ClientIdentity::default(), "e".into());
        table.create(1, ClientIdentity::default(), "f".into());
        assert_eq!(table.drop_builder(1).len(), 2);
        assert_eq!(table.count_for(1), 0);
        assert_eq!(table.len(), 1);
    }
}
