//! Bounded FIFO of pending claims between the HTTP workers and the
//! persistence worker.
//!
//! A full queue is our admission control: producers wait briefly for
//! room and then give up, which the caller reports as a user-visible
//! failure.
use crate::claim::Claim;
use mptc::signals::SignalTracker;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Most claims we hold before turning producers away.
pub const QUEUE_MAX: usize = 800;

/// Most claims handed to the persistence worker at once.
pub const BATCH_MAX: usize = 64;

pub struct ClaimQueue {
    capacity: usize,
    claims: Mutex<VecDeque<Claim>>,
    non_full: Condvar,
    non_empty: Condvar,
    signals: SignalTracker,
}

impl ClaimQueue {
    pub fn new(signals: SignalTracker) -> Self {
        Self::with_capacity(QUEUE_MAX, signals)
    }

    pub fn with_capacity(capacity: usize, signals: SignalTracker) -> Self {
        let capacity = capacity.max(1);
        ClaimQueue {
            capacity,
            claims: Mutex::new(VecDeque::with_capacity(capacity)),
            non_full: Condvar::new(),
            non_empty: Condvar::new(),
            signals,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Claim>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait on the condition for no longer than the deadline and no
    /// longer than the shutdown poll granularity.
    ///
    /// The returned flag is false when the wait should be abandoned.
    fn wait_on<'a>(
        &self,
        cvar: &Condvar,
        guard: MutexGuard<'a, VecDeque<Claim>>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, VecDeque<Claim>>, bool) {
        if self.signals.shutdown_requested() {
            return (guard, false);
        }

        let mut slice = Duration::from_millis(mptc::WAIT_GRANULARITY);

        if let Some(d) = deadline {
            let now = Instant::now();
            if now >= d {
                return (guard, false);
            }
            slice = slice.min(d - now);
        }

        let guard = match cvar.wait_timeout(guard, slice) {
            Ok((g, _)) => g,
            Err(e) => e.into_inner().0,
        };

        (guard, true)
    }

    /// Append a claim, waiting until the deadline for room.
    ///
    /// Returns false if the queue stayed full until the deadline
    /// passed, or if a shutdown has been requested.  The shutdown
    /// check happens under the queue lock, so a claim we accept is
    /// always seen by the consumer's final drain.
    pub fn enqueue(&self, claim: Claim, deadline: Instant) -> bool {
        let mut claims = self.lock();

        while claims.len() >= self.capacity {
            let (g, keep_waiting) = self.wait_on(&self.non_full, claims, Some(deadline));
            claims = g;
            if !keep_waiting {
                break;
            }
        }

        if self.signals.shutdown_requested() || claims.len() >= self.capacity {
            return false;
        }

        claims.push_back(claim);
        drop(claims);

        self.non_empty.notify_one();

        true
    }

    /// Remove up to max_items claims from the head of the queue,
    /// waiting until the deadline (None means forever) for at least
    /// one to arrive.
    ///
    /// Returns an empty list on timeout, or on shutdown once the queue
    /// has been drained.
    pub fn drain_up_to(&self, max_items: usize, deadline: Option<Instant>) -> Vec<Claim> {
        let mut claims = self.lock();

        while claims.is_empty() {
            let (g, keep_waiting) = self.wait_on(&self.non_empty, claims, deadline);
            claims = g;
            if !keep_waiting {
                break;
            }
        }

        let was_full = claims.len() >= self.capacity;
        let count = max_items.min(claims.len());
        let batch: Vec<Claim> = claims.drain(..count).collect();

        drop(claims);

        if was_full && count > 0 {
            self.non_full.notify_all();
        }

        batch
    }

    /// Wake every waiter so it re-checks the shutdown flag now rather
    /// than at its next poll.
    pub fn interrupt(&self) {
        let _claims = self.lock();
        self.non_full.notify_all();
        self.non_empty.notify_all();
    }
}
