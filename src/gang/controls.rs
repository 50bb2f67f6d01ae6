//! Round gating and distributed idle detection for a gang's workers.
//!
//! # Round protocol
//!
//! ```text
//!           control_work_ready(n)                 token claims
//!  Idle ───────────────────────────► n tokens ───────────────────► Active
//!   ▲     (waits until the previous   (work_ready = n)   (each worker
//!   │      round's tokens are all                          decrements one)
//!   │      claimed: work_ready == 0)
//!   │
//!   └─────────── workers_busy returns to 0 (idle barrier) ◄────────┘
//! ```
//!
//! `control_quit` follows the same token handshake with the quit flag set;
//! workers observe it on their next claim and exit.
//!
//! # Idle barrier contract (happens-before)
//!
//! `workers_busy` counts workers that are executing work or about to check
//! the queue. The rules each worker must follow:
//!
//! 1. Increment immediately after claiming a round token, before the first
//!    queue check. (Each worker arms its own count; decrements therefore
//!    always pair a same-thread increment, and the counter stays exact
//!    even when a worker enters a round late.)
//! 2. Decrement only after observing an empty pop. While idle, re-arm
//!    (increment) *before* the next queue check, and only when the queue
//!    reports work in flight; a successful pop therefore always finds its
//!    consumer already counted busy, and the popped item's function runs
//!    inside that window.
//!
//! New work is only pushed from inside a worker function, while its
//! consumer's increment is outstanding. So `workers_busy` cannot reach
//! zero while work exists that the queue has not yet made visible: a
//! decrement that lands on zero, or an idle worker observing
//! "queue finished and counter zero", means the round is over.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct RoundState {
    /// Tokens remaining for the current round; zero means no round is
    /// being launched.
    work_ready: u32,
    /// Set by `control_quit`; observed by workers on token claim.
    quit: bool,
}

/// Coordinates a fixed pool of workers between idle and running phases.
#[derive(Debug)]
pub struct AsyncControls {
    state: Mutex<RoundState>,
    round_cond: Condvar,
    workers_busy: AtomicI64,
}

impl Default for AsyncControls {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncControls {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoundState {
                work_ready: 0,
                quit: false,
            }),
            round_cond: Condvar::new(),
            workers_busy: AtomicI64::new(0),
        }
    }

    /// Launch a round for `worker_count` workers.
    ///
    /// Blocks until every token of the previous round (or quit) has been
    /// claimed; only one round can be in flight per gang.
    pub fn control_work_ready(&self, worker_count: u32) {
        let mut state = self.lock_state();
        while state.work_ready != 0 {
            state = self.wait(state);
        }
        state.work_ready = worker_count;
        state.quit = false;
        self.round_cond.notify_all();
    }

    /// Tell all `worker_count` workers to exit at their next token claim.
    pub fn control_quit(&self, worker_count: u32) {
        let mut state = self.lock_state();
        while state.work_ready != 0 {
            state = self.wait(state);
        }
        state.work_ready = worker_count;
        state.quit = true;
        self.round_cond.notify_all();
    }

    /// Block until a round (or quit) is signalled, then claim one token.
    ///
    /// Returns `true` when a round started, `false` for quit. Called once
    /// per worker per round.
    pub fn worker_wait_for_work(&self) -> bool {
        let mut state = self.lock_state();
        while state.work_ready == 0 {
            state = self.wait(state);
        }
        state.work_ready -= 1;
        let quit = state.quit;
        // Wake the controller blocked on "all tokens claimed" (and any
        // peers still waiting on the condition).
        self.round_cond.notify_all();
        !quit
    }

    /// Mark this worker busy (entering a round, or resuming after idle).
    #[inline]
    pub fn worker_am_busy(&self) {
        self.workers_busy.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark this worker idle. Returns `true` iff this decrement brought
    /// the busy count to zero, i.e. this worker is the last to go idle and the
    /// round is over.
    #[inline]
    pub fn worker_am_idle(&self) -> bool {
        self.workers_busy.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Whether every worker is currently idle. Polled (together with the
    /// queue's finished check) by workers that have already decremented
    /// and are waiting for the round to wind down.
    #[inline]
    pub fn all_idle(&self) -> bool {
        self.workers_busy.load(Ordering::SeqCst) == 0
    }

    /// Current busy count (diagnostics).
    pub fn workers_busy(&self) -> i64 {
        self.workers_busy.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RoundState> {
        self.state.lock().expect("controls mutex poisoned")
    }

    fn wait<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, RoundState>,
    ) -> std::sync::MutexGuard<'a, RoundState> {
        self.round_cond
            .wait(guard)
            .expect("controls mutex poisoned")
    }
}
