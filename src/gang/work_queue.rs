//! Bounded lock-free work queue with an in-flight counter.
//!
//! The queue tracks items that are *queued or being processed*; the
//! counter is incremented before an item becomes visible and decremented
//! only after its worker function returns. `count == 0` therefore means
//! work has run out entirely, not merely that the queue looks empty.
//!
//! A failed pop while the counter is non-zero means another producer is
//! mid-push (or another consumer holds the only item): that is the
//! [`ConsumeStatus::Waiting`] condition, normal control flow for spinning
//! consumers.
//!
//! # Capacity
//!
//! The backing ring is fixed-size and offers no backpressure: a full push
//! is a misconfigured queue for the workload and panics. Size the queue to
//! the expected working set at construction.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

/// Worker function: `(worker_id, parameter, queue) -> result`. Plain `fn`
/// pointers so items stay `Copy` and safe to move through the lock-free
/// ring; the function may push follow-up items onto the queue it is handed
/// (tail-recursive subdivision).
pub type WorkFn<P, R> = fn(u32, P, &WorkQueue<P, R>) -> R;

/// One unit of work: a parameter and the function to invoke on it.
#[derive(Debug)]
pub struct WorkItem<P, R> {
    pub func: WorkFn<P, R>,
    pub param: P,
}

impl<P, R> WorkItem<P, R> {
    pub fn new(func: WorkFn<P, R>, param: P) -> Self {
        Self { func, param }
    }
}

// Manual impls: `fn` pointers are always Copy, so only P constrains these.
impl<P: Clone, R> Clone for WorkItem<P, R> {
    fn clone(&self) -> Self {
        Self {
            func: self.func,
            param: self.param.clone(),
        }
    }
}
impl<P: Copy, R> Copy for WorkItem<P, R> {}

/// Outcome of one [`WorkQueue::consume`] call.
#[derive(Debug)]
pub enum ConsumeStatus<R> {
    /// An item was consumed; its result is attached.
    Busy(R),
    /// An item was consumed but its function panicked; the item is
    /// abandoned and the round continues.
    Aborted,
    /// No item was popped, but work is still in flight; spin and retry.
    Waiting,
    /// No work is queued or being processed.
    Finished,
}

/// Bounded concurrent queue plus in-flight counter.
pub struct WorkQueue<P, R> {
    items: ArrayQueue<WorkItem<P, R>>,
    /// Items queued or being processed. Padded: this is the hottest shared
    /// counter in a round.
    count: CachePadded<AtomicU64>,
}

impl<P, R> WorkQueue<P, R> {
    /// Create a queue holding at most `capacity` simultaneous items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "work queue capacity must be > 0");
        Self {
            items: ArrayQueue::new(capacity),
            count: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a work item.
    ///
    /// The counter rises before the item is visible, so a consumer that
    /// races this push sees `Waiting`, never a premature `Finished`.
    ///
    /// # Panics
    /// Panics if the queue is full: capacity is a configuration contract,
    /// not a throttle (see module docs).
    pub fn push(&self, item: WorkItem<P, R>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.items.push(item).is_err() {
            panic!(
                "work queue capacity exceeded ({}); size the queue to the workload's working set",
                self.items.capacity()
            );
        }
    }

    /// Try to consume one item, invoking its function with `worker_id` and
    /// this queue (so the function can push follow-up work).
    ///
    /// A panicking function aborts only its own item ([`ConsumeStatus::Aborted`]);
    /// the in-flight counter is kept exact either way.
    pub fn consume(&self, worker_id: u32) -> ConsumeStatus<R> {
        if self.count.load(Ordering::SeqCst) == 0 {
            return ConsumeStatus::Finished;
        }
        match self.items.pop() {
            Some(item) => {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| (item.func)(worker_id, item.param, self)));
                // The decrement must come after the function call: while the
                // function runs, its pushes happen with this item still
                // counted in flight.
                self.count.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(retval) => ConsumeStatus::Busy(retval),
                    Err(_) => {
                        log::warn!("worker {worker_id}: work item panicked; item aborted");
                        ConsumeStatus::Aborted
                    }
                }
            }
            None => ConsumeStatus::Waiting,
        }
    }

    /// Whether no work remains queued or in processing.
    pub fn finished(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }

    /// Items queued or being processed right now.
    pub fn in_flight(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Maximum simultaneous items.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}


#[cfg(test)]
mod concurrent_tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    static CONSUMED: AtomicU64 = AtomicU64::new(0);

    fn count_one(_id: u32, _param: u32, _queue: &WorkQueue<u32, u32>) -> u32 {
        CONSUMED.fetch_add(1, Ordering::Relaxed);
        0
    }

    /// Producers racing consumers: every pushed item is consumed exactly
    /// once and the counter settles at zero.
    #[test]
    fn concurrent_push_consume_balances() {
        CONSUMED.store(0, Ordering::Relaxed);
        let queue: Arc<WorkQueue<u32, u32>> = Arc::new(WorkQueue::new(100_000));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..10_000 {
                        queue.push(WorkItem::new(count_one, i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut consumed = 0u64;
                    loop {
                        match queue.consume(t) {
                            ConsumeStatus::Busy(_) => consumed += 1,
                            ConsumeStatus::Waiting => thread::yield_now(),
                            ConsumeStatus::Finished => break,
                            ConsumeStatus::Aborted => unreachable!(),
                        }
                    }
                    consumed
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();

        // Consumers may exit early (count transiently 0 before a later
        // producer push), so drain the remainder here.
        let mut drained = 0u64;
        while let ConsumeStatus::Busy(_) = queue.consume(0) {
            drained += 1;
        }

        assert_eq!(total + drained, 40_000);
        assert_eq!(CONSUMED.load(Ordering::Relaxed), 40_000);
        assert!(queue.finished());
    }
}
