//! Fan-in dependency: a counter that releases one final work item.
//!
//! A dependency is retained once per prerequisite task; each finishing
//! prerequisite checks in. The check-in that drops the count to zero
//! enqueues the stored final item (exactly once, regardless of how the
//! check-ins interleave across threads) and tells its caller that
//! ownership of the dependency has passed to it for disposal.

use std::sync::atomic::{AtomicU64, Ordering};

use super::work_queue::{WorkItem, WorkQueue};

/// Atomic fan-in counter holding the item to enqueue when it reaches zero.
#[derive(Debug)]
pub struct WorkDependency<P, R> {
    count: AtomicU64,
    final_item: WorkItem<P, R>,
}

impl<P: Copy, R> WorkDependency<P, R> {
    /// Create a dependency that will enqueue `final_item` once fulfilled.
    ///
    /// The count starts at zero; call [`retain`](Self::retain) before
    /// handing the dependency to the tasks that will check in.
    pub fn new(final_item: WorkItem<P, R>) -> Self {
        Self {
            count: AtomicU64::new(0),
            final_item,
        }
    }

    /// Add `times` outstanding prerequisites.
    pub fn retain(&self, times: u64) {
        self.count.fetch_add(times, Ordering::SeqCst);
    }

    /// Check in one finished prerequisite.
    ///
    /// If this was the last one, pushes the final item onto `queue` and
    /// returns `true`; the caller is now responsible for disposing of the
    /// dependency. Returns `false` otherwise.
    ///
    /// # Panics
    /// Panics if called with no outstanding prerequisites (a check without
    /// a matching retain).
    pub fn check(&self, queue: &WorkQueue<P, R>) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(previous != 0, "dependency check without matching retain");
        if previous == 1 {
            queue.push(self.final_item);
            return true;
        }
        false
    }

    /// Outstanding prerequisite count (diagnostics).
    pub fn outstanding(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::super::work_queue::ConsumeStatus;
    use super::*;

    fn finale(_id: u32, param: u32, _queue: &WorkQueue<u32, u32>) -> u32 {
        param
    }

    #[test]
    fn single_prerequisite_releases_on_first_check() {
        let queue: WorkQueue<u32, u32> = WorkQueue::new(4);
        let dep = WorkDependency::new(WorkItem::new(finale, 99));
        dep.retain(1);

        assert!(dep.check(&queue));
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn release_happens_only_after_all_checks() {
        let queue: WorkQueue<u32, u32> = WorkQueue::new(4);
        let dep = WorkDependency::new(WorkItem::new(finale, 7));
        dep.retain(3);

        assert!(!dep.check(&queue));
        assert!(!dep.check(&queue));
        assert!(queue.finished());

        assert!(dep.check(&queue));
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn retains_accumulate() {
        let queue: WorkQueue<u32, u32> = WorkQueue::new(4);
        let dep = WorkDependency::new(WorkItem::new(finale, 7));
        dep.retain(1);
        dep.retain(2);
        assert_eq!(dep.outstanding(), 3);

        assert!(!dep.check(&queue));
        assert!(!dep.check(&queue));
        assert!(dep.check(&queue));
    }

    #[test]
    #[should_panic(expected = "without matching retain")]
    fn check_without_retain_panics() {
        let queue: WorkQueue<u32, u32> = WorkQueue::new(4);
        let dep = WorkDependency::new(WorkItem::new(finale, 7));
        dep.check(&queue);
    }

    #[test]
    fn released_item_carries_the_stored_parameter() {
        let queue: WorkQueue<u32, u32> = WorkQueue::new(4);
        let dep = WorkDependency::new(WorkItem::new(finale, 1234));
        dep.retain(1);
        dep.check(&queue);

        match queue.consume(0) {
            ConsumeStatus::Busy(v) => assert_eq!(v, 1234),
            other => panic!("expected Busy, got {other:?}"),
        }
    }
}
