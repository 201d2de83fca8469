//! Single-flight coordination for token refresh.
//!
//! DESIGN
//! ======
//! One coordinator per `SessionClient`. The first caller to see a 401 becomes
//! the leader and performs the refresh; every caller arriving while the leader
//! is busy parks a `oneshot` sender in a FIFO queue. The leader publishes one
//! outcome, the queue is drained in arrival order, and only then is the
//! in-progress flag cleared. All of that happens under one lock, so no caller
//! can slip in between the drain and the flag reset.
//!
//! A leader that is dropped before finishing (its future cancelled) rejects
//! the queue with `RefreshError::Abandoned` so waiters never hang.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::RefreshError;

type Outcome = Result<String, RefreshError>;

#[derive(Debug, Default)]
struct State {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<Outcome>>,
}

/// Guards the one refresh operation allowed at a time.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    state: Mutex<State>,
}

/// What a caller that hit a 401 must do next.
pub enum Ticket<'a> {
    /// Perform the refresh and report through the guard.
    Leader(LeaderGuard<'a>),
    /// Wait for the leader's outcome.
    Waiter(oneshot::Receiver<Outcome>),
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader if no refresh is running, otherwise queue up.
    pub fn join(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            return Ticket::Waiter(rx);
        }
        state.in_flight = true;
        Ticket::Leader(LeaderGuard {
            coordinator: self,
            finished: false,
        })
    }

    /// Whether a refresh is currently running.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of callers parked behind the running refresh.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    fn complete(&self, outcome: &Outcome) {
        let mut state = self.lock();
        for waiter in state.waiters.drain(..) {
            // A waiter whose caller went away has dropped its receiver.
            let _ = waiter.send(outcome.clone());
        }
        state.in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the refresh leader; publishing the outcome consumes it.
pub struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    finished: bool,
}

impl LeaderGuard<'_> {
    /// Release every queued caller with `outcome`, then clear the flag.
    pub fn finish(mut self, outcome: &Outcome) {
        self.finished = true;
        self.coordinator.complete(outcome);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.complete(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
