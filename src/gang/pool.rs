//! Round-based worker gang.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────┐
//!                 │                    AsyncGang                     │
//!                 │                                                  │
//!   push ─────────┼──► WorkQueue (bounded, lock-free) ◄─────┐        │
//!                 │        │                                │        │
//!                 │        ▼  consume            push (recursive)    │
//!                 │   ┌─────────┬─────────┬─────────┐       │        │
//!                 │   │ worker 0│ worker 1│ worker N│ ──────┘        │
//!                 │   └────┬────┴────┬────┴────┬────┘                │
//!                 │        │         │         │                     │
//!                 │        └── AsyncControls ──┘   (round tokens,    │
//!                 │              │                  idle barrier)    │
//!   start ────────┼──────────────┘                                   │
//!   RoundHandle ◄─┼── worker 0 publishes the round result            │
//!                 └──────────────────────────────────────────────────┘
//! ```
//!
//! A gang owns a fixed pool of OS threads for its whole lifetime. Each
//! round: the caller seeds the queue, `start()` wakes the pool, workers
//! pop parameters and invoke the item's function, which may push more
//! parameters, fanning work out recursively. The round ends when the
//! idle barrier sees every worker simultaneously idle. Workers busy-poll
//! with a cooperative yield between empty pops rather than blocking,
//! trading CPU for latency during a round.
//!
//! # Round result
//!
//! By inherited convention only the designated worker's (the first
//! spawned) last item result is published; other workers' results are
//! discarded. See DESIGN.md: preserved as-is rather than silently
//! replaced with a reduce semantics.
//!
//! # Correctness invariant (idle barrier)
//!
//! A worker decrements the busy count only after observing an empty pop
//! while not already idle, and re-increments only after a successful pop
//! while idle. New work can only be pushed by a worker inside an item
//! function, i.e. while its own increment is still outstanding, so the
//! busy count cannot reach zero while undelivered work exists. See
//! [`AsyncControls`](super::controls::AsyncControls) for the full
//! happens-before contract.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use super::controls::AsyncControls;
use super::thread_allocation::ThreadAllocation;
use super::work_queue::{ConsumeStatus, WorkItem, WorkQueue};

/// Awaitable handle for one round's aggregated result.
#[derive(Debug)]
pub struct RoundHandle<R> {
    receiver: Receiver<R>,
}

impl<R> RoundHandle<R> {
    /// Block until the designated worker publishes the round result.
    pub fn wait(self) -> R {
        self.receiver
            .recv()
            .expect("gang workers exited without publishing a round result")
    }
}

type ResultSlot<R> = Arc<Mutex<Option<Sender<R>>>>;

/// Fixed thread pool driving repeatable rounds of recursive work.
pub struct AsyncGang<P, R>
where
    P: Send + 'static,
    R: Default + Send + 'static,
{
    workers: Vec<JoinHandle<()>>,
    thread_ids: Vec<u32>,
    controls: Arc<AsyncControls>,
    queue: Arc<WorkQueue<P, R>>,
    result_slot: ResultSlot<R>,
}

impl<P, R> AsyncGang<P, R>
where
    P: Send + 'static,
    R: Default + Send + 'static,
{
    /// Spawn a gang of `concurrency` workers (clamped to the identifiers
    /// `threads` can still issue) sharing a queue of `queue_capacity`.
    pub fn new(queue_capacity: usize, threads: &mut ThreadAllocation, concurrency: u32) -> Self {
        let worker_count = concurrency.min(threads.max_new_ids());
        assert!(worker_count > 0, "gang needs at least one worker");

        let controls = Arc::new(AsyncControls::new());
        let queue = Arc::new(WorkQueue::new(queue_capacity));
        let result_slot: ResultSlot<R> = Arc::new(Mutex::new(None));

        let thread_ids: Vec<u32> = (0..worker_count).map(|_| threads.new_id()).collect();
        let workers = thread_ids
            .iter()
            .enumerate()
            .map(|(ordinal, &id)| {
                let controls = Arc::clone(&controls);
                let queue = Arc::clone(&queue);
                let result_slot = Arc::clone(&result_slot);
                // The first spawned worker publishes round results.
                let designated = ordinal == 0;
                thread::Builder::new()
                    .name(format!("gang-worker-{id}"))
                    .spawn(move || worker_main(id, designated, &controls, &queue, &result_slot))
                    .expect("failed to spawn gang worker thread")
            })
            .collect();

        Self {
            workers,
            thread_ids,
            controls,
            queue,
            result_slot,
        }
    }

    /// Spawn a gang sized to the machine.
    pub fn with_default_concurrency(queue_capacity: usize, threads: &mut ThreadAllocation) -> Self {
        let concurrency = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::new(queue_capacity, threads, concurrency)
    }

    /// Number of workers in the pool.
    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// The workers' allocated identifiers.
    pub fn thread_ids(&self) -> &[u32] {
        &self.thread_ids
    }

    /// Seed a work item before (or, from a worker function, during) a round.
    pub fn push(&self, item: WorkItem<P, R>) {
        self.queue.push(item);
    }

    /// Whether the queue holds no outstanding work.
    pub fn no_queued_work(&self) -> bool {
        self.queue.finished()
    }

    /// Busy-worker count (diagnostics; zero between rounds).
    pub fn workers_busy(&self) -> i64 {
        self.controls.workers_busy()
    }

    /// Launch a round over `initial` plus anything already pushed.
    ///
    /// Returns a handle resolved when the round's recursive work is fully
    /// complete. Only one round may be in flight per gang: callers must
    /// wait on the handle before starting the next.
    pub fn start(&self, initial: impl IntoIterator<Item = WorkItem<P, R>>) -> RoundHandle<R> {
        for item in initial {
            self.queue.push(item);
        }

        let (sender, receiver) = bounded(1);
        *self
            .result_slot
            .lock()
            .expect("result slot mutex poisoned") = Some(sender);

        self.controls.control_work_ready(self.workers.len() as u32);
        RoundHandle { receiver }
    }

    /// Tell every worker to quit and join the pool. Teardown only: a
    /// running round completes before workers observe the quit.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.controls.control_quit(self.workers.len() as u32);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl<P, R> Drop for AsyncGang<P, R>
where
    P: Send + 'static,
    R: Default + Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-worker thread body: claim a round token, drive the round to the
/// idle barrier, publish if designated, repeat until quit.
fn worker_main<P, R>(
    id: u32,
    designated: bool,
    controls: &AsyncControls,
    queue: &WorkQueue<P, R>,
    result_slot: &ResultSlot<R>,
) where
    P: Send + 'static,
    R: Default + Send + 'static,
{
    while controls.worker_wait_for_work() {
        // Arm the idle barrier before the first queue check (rule 1 of the
        // barrier contract).
        controls.worker_am_busy();

        let mut last = R::default();
        let mut was_idle = false;
        loop {
            if was_idle {
                if queue.finished() {
                    // Nothing queued or mid-processing. If the barrier is
                    // also clear the round is over; otherwise some worker
                    // is still winding down its last item.
                    if controls.all_idle() {
                        break;
                    }
                    thread::yield_now();
                    continue;
                }
                // Work reappeared: re-arm before checking the queue, so a
                // successful pop finds its consumer already counted busy
                // (the item's function, and any pushes it makes, run
                // inside consume).
                controls.worker_am_busy();
                was_idle = false;
            }
            match queue.consume(id) {
                ConsumeStatus::Busy(retval) => last = retval,
                ConsumeStatus::Aborted => {
                    // The item panicked, but this worker did consume it.
                }
                ConsumeStatus::Waiting | ConsumeStatus::Finished => {
                    was_idle = true;
                    if controls.worker_am_idle() {
                        // This decrement saw every worker idle at once: no
                        // one is mid-item, so nothing new can be pushed.
                        // The round is over.
                        break;
                    }
                    // Something will probably turn up very soon; spin
                    // cooperatively rather than blocking.
                    thread::yield_now();
                }
            }
        }

        if designated {
            let sender = result_slot
                .lock()
                .expect("result slot mutex poisoned")
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(last);
            }
        }
    }
}
