//! Concurrent runtime for procedural world generation: a round-based gang
//! scheduler and a lock-free memoization map.
//!
//! ## Scope
//! This crate owns the concurrency-hard core of the engine: scheduling
//! recursive fan-out/fan-in work across a fixed thread pool, and caching
//! expensive per-key artifacts (e.g. per-spatial-cell geometry inputs)
//! under heavy concurrent read/write turnover. Rendering, generation
//! algorithms, configuration and I/O live with the callers; they only
//! push work and look up keys here.
//!
//! ## Key invariants
//! - A round's recursive work, including everything worker functions push
//!   mid-round, fully completes before the round's handle resolves. The
//!   idle barrier ties "busy" to *observing* an empty pop, never to the
//!   queue looking momentarily empty, so the push/observe race cannot end
//!   a round early.
//! - All hot-path shared state (queue slots, map chain slots, slab in-use
//!   flags) is touched only through atomic CAS; mutexes guard nothing but
//!   the rare block/chain appends.
//! - The map hands out indices, not pointers, across threads, and every
//!   indexed access re-validates slot liveness.
//! - Capacity exhaustion, double frees and stale-index accesses are
//!   programming errors: they panic immediately rather than degrade.
//!
//! ## Runtime flow (one round)
//! 1) Seed the gang's queue with parameters (`gang.push`, or `start`'s
//!    initial set).
//! 2) `start()` wakes the pool; each worker repeatedly pops a parameter
//!    and invokes its work function, which may push further parameters
//!    (tail-recursive subdivision across levels of detail).
//! 3) The distributed idle barrier detects that no worker is busy and no
//!    work is in flight; the designated worker publishes the round result.
//!
//! ## Notable entry points
//! - [`AsyncGang`] / [`WorkQueue`] / [`WorkItem`]: round scheduling.
//! - [`WorkDependency`]: fan-in; N tasks check in, one final task fires.
//! - [`Polymer`]: lock-free insert-or-get map (`entry` / `get`).
//! - [`Substrate`]: the slab allocator behind the map, usable on its own
//!   for other heavy-churn fixed-size records.
//!
//! ## Design trade-offs
//! Inserting into the map is non-blocking even under contention; in
//! exchange, two threads racing the same fresh key may each publish an
//! entry (documented relaxed semantics; see `polymer::map`). Workers
//! busy-poll during a round instead of parking, trading idle CPU for
//! wake-up latency on bursty subdivision.

pub mod gang;
pub mod polymer;
pub mod rng;
#[cfg(test)]
pub mod test_utils;

pub use gang::{
    AsyncControls, AsyncGang, ConsumeStatus, RoundHandle, ThreadAllocation, WorkDependency,
    WorkFn, WorkItem, WorkQueue, MAX_WORKER_IDS,
};
pub use polymer::{Monomer, Polymer, StructureStats, Substrate, SubstrateIndex};
pub use rng::XorShift64;
