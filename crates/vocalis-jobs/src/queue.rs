//! Bounded FIFO queue of task ids waiting for a worker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use vocalis_core::{Error, Result, TaskId};

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<TaskId>,
    /// Slots claimed by submissions still persisting their record.
    reserved: usize,
}

impl QueueState {
    fn occupancy(&self) -> usize {
        self.entries.len() + self.reserved
    }
}

/// FIFO queue with a hard occupancy limit.
///
/// Occupancy counts queued entries plus outstanding [`Reservation`]s, so a
/// slot is claimed before the record is written and concurrent submissions
/// can never overshoot the capacity.
#[derive(Debug)]
pub struct JobQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is plain data; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a slot, or fail with `QueueFull` without waiting.
    pub fn try_reserve(&self) -> Result<Reservation<'_>> {
        let mut state = self.lock();
        if state.occupancy() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(Reservation {
            queue: self,
            active: true,
        })
    }

    fn commit_reserved(&self, id: TaskId) {
        {
            let mut state = self.lock();
            state.reserved -= 1;
            state.entries.push_back(id);
        }
        self.notify.notify_one();
    }

    fn release_reserved(&self) {
        let mut state = self.lock();
        state.reserved -= 1;
    }

    fn try_pop(&self) -> Option<TaskId> {
        let (id, more) = {
            let mut state = self.lock();
            let id = state.entries.pop_front();
            (id, !state.entries.is_empty())
        };
        if id.is_some() && more {
            // Pass the wakeup on so another idle worker sees the rest.
            self.notify.notify_one();
        }
        id
    }

    /// Wait for the next id in FIFO order.
    ///
    /// Returns `None` once `shutdown` is cancelled; no entry is taken after
    /// that point.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<TaskId> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_pop() {
                return Some(id);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Withdraw a waiting entry. Other entries keep their order.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut state = self.lock();
        match state.entries.iter().position(|entry| *entry == id) {
            Some(index) => {
                state.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().entries.contains(&id)
    }

    /// Entries waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries plus outstanding reservations.
    pub fn occupancy(&self) -> usize {
        self.lock().occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A claimed queue slot. Dropping it without [`commit`](Self::commit)
/// returns the slot.
#[must_use = "a reservation holds a queue slot until committed or dropped"]
#[derive(Debug)]
pub struct Reservation<'a> {
    queue: &'a JobQueue,
    active: bool,
}

impl Reservation<'_> {
    /// Turn the slot into a queue entry and wake one waiting worker.
    pub fn commit(mut self, id: TaskId) {
        self.active = false;
        self.queue.commit_reserved(id);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.queue.release_reserved();
        }
    }
}
