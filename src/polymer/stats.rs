//! Occupancy and contention counters shared by the lock-free structures.
//!
//! Both the substrate allocator and the polymer map record how many probe
//! attempts each insert needed. Mean contention creeping toward the
//! configured target is the signal that the structure is running hot and
//! the next insert is likely to force growth.
//!
//! Counters are independently `Relaxed`-updated; a reader may observe a
//! size that is one ahead of the contention sample count. That level of
//! skew is fine for diagnostics and for growth heuristics.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic occupancy/contention counters.
#[derive(Debug, Default)]
pub struct StructureStats {
    /// Number of entries currently live in the structure.
    size: AtomicU64,
    /// Accumulated probe retries across sampled inserts.
    contention: AtomicU64,
    /// Number of inserts sampled into `contention`.
    contention_samples: AtomicU64,
}

impl StructureStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed insert that needed `tries` probe attempts.
    #[inline]
    pub fn inserted_one(&self, tries: u32) {
        self.size.fetch_add(1, Ordering::Relaxed);
        self.contention.fetch_add(u64::from(tries), Ordering::Relaxed);
        self.contention_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a removal.
    #[inline]
    pub fn erased_one(&self) {
        self.size.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current entry count.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Mean probe attempts per sampled insert, or 0.0 before any sample.
    pub fn mean_contention(&self) -> f64 {
        let samples = self.contention_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.contention.load(Ordering::Relaxed) as f64 / samples as f64
    }

    /// Integer mean contention, resetting the sample window.
    ///
    /// Returns 0 if nothing was sampled since the last reset. The two
    /// resets are not atomic with respect to each other; a concurrent
    /// insert may land in either window.
    pub fn contention_and_reset(&self) -> u64 {
        let contention = self.contention.swap(0, Ordering::Relaxed);
        let samples = self.contention_samples.swap(0, Ordering::Relaxed);
        if samples == 0 {
            0
        } else {
            contention / samples
        }
    }

    /// Write a two-line occupancy/contention report.
    pub fn print_stats(&self, out: &mut dyn Write, prefix: &str) -> io::Result<()> {
        writeln!(out, "{}: size: {}", prefix, self.size())?;
        writeln!(out, "{}: contention: {:.2}", prefix, self.mean_contention())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_erase_track_size() {
        let stats = StructureStats::new();
        stats.inserted_one(0);
        stats.inserted_one(3);
        assert_eq!(stats.size(), 2);

        stats.erased_one();
        assert_eq!(stats.size(), 1);
    }

    #[test]
    fn mean_contention_averages_tries() {
        let stats = StructureStats::new();
        stats.inserted_one(2);
        stats.inserted_one(4);
        assert!((stats.mean_contention() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mean_contention_zero_before_any_sample() {
        let stats = StructureStats::new();
        assert_eq!(stats.mean_contention(), 0.0);
        assert_eq!(stats.contention_and_reset(), 0);
    }

    #[test]
    fn reset_clears_sample_window() {
        let stats = StructureStats::new();
        stats.inserted_one(6);
        stats.inserted_one(2);
        assert_eq!(stats.contention_and_reset(), 4);
        assert_eq!(stats.contention_and_reset(), 0);
        // Size survives the reset.
        assert_eq!(stats.size(), 2);
    }

    #[test]
    fn print_stats_names_both_counters() {
        let stats = StructureStats::new();
        stats.inserted_one(1);

        let mut buf = Vec::new();
        stats.print_stats(&mut buf, "cache").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("cache: size: 1"));
        assert!(text.contains("contention"));
    }

    #[test]
    fn concurrent_inserts_are_not_lost() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(StructureStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inserted_one(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.size(), 4000);
        assert!((stats.mean_contention() - 1.0).abs() < f64::EPSILON);
    }
}
