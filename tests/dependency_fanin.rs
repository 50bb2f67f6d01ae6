//! Fan-in exactly-once property under concurrent check-ins.
//!
//! A dependency retained for k prerequisites must enqueue its final item
//! exactly once, only after the k-th check, no matter how the check-ins
//! interleave across threads. Check-in order is randomized with small
//! yields to vary the interleavings between iterations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use gang_rs::{ConsumeStatus, WorkDependency, WorkItem, WorkQueue, XorShift64};

static FINALS_RUN: AtomicU32 = AtomicU32::new(0);

fn final_task(_id: u32, marker: u32, _queue: &WorkQueue<u32, bool>) -> bool {
    FINALS_RUN.fetch_add(1, Ordering::SeqCst);
    marker == 0xF1A1
}

fn run_fan_in(k: u64, threads: usize, seed: u64) {
    let queue: Arc<WorkQueue<u32, bool>> = Arc::new(WorkQueue::new(4));
    let dep = Arc::new(WorkDependency::new(WorkItem::new(final_task, 0xF1A1)));
    dep.retain(k);

    // Nothing fires before the last check: run all but one check-in
    // concurrently, then verify, then deliver the last one.
    let early = k - 1;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let dep = Arc::clone(&dep);
            let queue = Arc::clone(&queue);
            // Spread k-1 checks over the workers.
            let share = early / threads as u64 + u64::from((early % threads as u64) > t as u64);
            let mut rng = XorShift64::new(seed ^ (t as u64) << 32);
            thread::spawn(move || {
                let mut released = 0u32;
                for _ in 0..share {
                    if rng.next_usize(4) == 0 {
                        thread::yield_now();
                    }
                    if dep.check(&queue) {
                        released += 1;
                    }
                }
                released
            })
        })
        .collect();

    let early_releases: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(early_releases, 0, "final item released before k checks");
    assert!(queue.finished());
    assert_eq!(dep.outstanding(), 1);

    assert!(dep.check(&queue), "k-th check must release the final item");
    assert_eq!(queue.in_flight(), 1);

    match queue.consume(0) {
        ConsumeStatus::Busy(true) => {}
        other => panic!("expected the stored final item, got {other:?}"),
    }
    assert!(queue.finished());
}

#[test]
fn fan_in_releases_exactly_once_for_all_sizes() {
    FINALS_RUN.store(0, Ordering::SeqCst);
    let mut expected = 0;
    for k in [1u64, 10, 1000] {
        for iteration in 0..20 {
            run_fan_in(k, 4, 0x9E3779B9 ^ (k << 8) ^ iteration);
            expected += 1;
            assert_eq!(FINALS_RUN.load(Ordering::SeqCst), expected);
        }
    }
}

/// All k checks racing freely (no held-back last check): still exactly one
/// release across the whole group.
#[test]
fn fully_concurrent_checks_release_exactly_once() {
    for k in [1u64, 10, 1000] {
        for iteration in 0..20 {
            let queue: Arc<WorkQueue<u32, bool>> = Arc::new(WorkQueue::new(4));
            let dep = Arc::new(WorkDependency::new(WorkItem::new(final_task, 0xF1A1)));
            dep.retain(k);

            let workers = 4u64;
            let handles: Vec<_> = (0..workers)
                .map(|t| {
                    let dep = Arc::clone(&dep);
                    let queue = Arc::clone(&queue);
                    let share = k / workers + u64::from((k % workers) > t);
                    let mut rng = XorShift64::new((iteration << 8) ^ t);
                    thread::spawn(move || {
                        let mut released = 0u32;
                        for _ in 0..share {
                            if rng.next_usize(8) == 0 {
                                thread::yield_now();
                            }
                            if dep.check(&queue) {
                                released += 1;
                            }
                        }
                        released
                    })
                })
                .collect();

            let releases: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(releases, 1, "k={k} iteration={iteration}");
            assert_eq!(queue.in_flight(), 1);
            assert_eq!(dep.outstanding(), 0);
        }
    }
}
