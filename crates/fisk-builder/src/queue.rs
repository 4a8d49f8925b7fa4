//! Job admission.
//!
//! A job holds one slot from admission until its terminal transition. Jobs
//! beyond the slot count wait FIFO and are admitted by `start_pending`,
//! which runs after every release. Nothing is ever started past capacity.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;

pub type JobId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} is already queued or running")]
    Duplicate(JobId),

    #[error("job {0} does not hold a slot")]
    NotRunning(JobId),

    #[error("job {0} was dropped from the queue")]
    Dropped(JobId),
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug)]
pub enum Admission {
    /// The job holds a slot now.
    Started,
    /// Resolves once the job has been given a slot.
    Queued(oneshot::Receiver<()>),
}

#[derive(Debug)]
pub struct JobQueue {
    slots: usize,
    running: BTreeSet<JobId>,
    waiting: VecDeque<(JobId, oneshot::Sender<()>)>,
}

impl JobQueue {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            running: BTreeSet::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains(&id)
    }

    pub fn enqueue(&mut self, id: JobId) -> Result<Admission, QueueError> {
        if self.running.contains(&id) || self.waiting.iter().any(|(w, _)| *w == id) {
            return Err(QueueError::Duplicate(id));
        }
        if self.running.len() < self.slots && self.waiting.is_empty() {
            self.running.insert(id);
            return Ok(Admission::Started);
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.push_back((id, tx));
        Ok(Admission::Queued(rx))
    }

    /// Free the slot of `id` and admit waiting jobs.
    pub fn release(&mut self, id: JobId) -> Result<Vec<JobId>, QueueError> {
        if !self.running.remove(&id) {
            return Err(QueueError::NotRunning(id));
        }
        Ok(self.start_pending())
    }

    /// Admit waiting jobs while slots are free. Returns the admitted ids.
    ///
    /// A waiter whose receiver is gone is skipped without taking a slot.
    pub fn start_pending(&mut self) -> Vec<JobId> {
        let mut started = Vec::new();
        while self.running.len() < self.slots {
            let Some((id, tx)) = self.waiting.pop_front() else {
                break;
            };
            if tx.send(()).is_ok() {
                self.running.insert(id);
                started.push(id);
            }
        }
        started
    }

    /// Withdraw `id`. A waiting job never starts; a job admitted in the
    /// meantime gives its slot back. Returns false if `id` was unknown.
    pub fn abort_queued(&mut self, id: JobId) -> bool {
        if let Some(pos) = self.waiting.iter().position(|(w, _)| *w == id) {
            self.waiting.remove(pos);
            return true;
        }
        if self.running.remove(&id) {
            self.start_pending();
            return true;
        }
        false
    }
}

fn lock(queue: &Mutex<JobQueue>) -> MutexGuard<'_, JobQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

/// A [`JobQueue`] shared between connection tasks.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<JobQueue>>,
}

impl SharedQueue {
    pub fn new(slots: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JobQueue::new(slots))),
        }
    }

    /// Wait for a slot for `id`.
    ///
    /// Dropping the future while queued withdraws the job.
    pub async fn acquire(&self, id: JobId) -> Result<Slot, QueueError> {
        let admission = lock(&self.inner).enqueue(id)?;
        if let Admission::Queued(rx) = admission {
            tracing::debug!(job = id, "job queued");
            let mut waiting = Waiting {
                queue: self,
                id,
                armed: true,
            };
            rx.await.map_err(|_| QueueError::Dropped(id))?;
            waiting.armed = false;
        }
        Ok(Slot {
            queue: self.clone(),
            id,
            released: false,
        })
    }

    pub fn running(&self) -> usize {
        lock(&self.inner).running()
    }

    pub fn waiting(&self) -> usize {
        lock(&self.inner).waiting()
    }
}

struct Waiting<'a> {
    queue: &'a SharedQueue,
    id: JobId,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.queue.inner).abort_queued(self.id);
        }
    }
}

/// An occupied slot. Released exactly once, on `release` or drop.
#[derive(Debug)]
pub struct Slot {
    queue: SharedQueue,
    id: JobId,
    released: bool,
}

impl Slot {
    pub fn job(&self) -> JobId {
        self.id
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        match lock(&self.queue.inner).release(self.id) {
            Ok(started) if !started.is_empty() => {
                tracing::debug!(job = self.id, admitted = ?started, "slot released")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "slot release failed"),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release_once();
    }
}
