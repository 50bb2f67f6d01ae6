//! Lock-free slab allocator for fixed-size records.
//!
//! A [`Substrate`] hands out integer indices into a growable list of
//! fixed-capacity blocks, avoiding the global allocator (and its locks) on
//! the hot path of structures with heavy record turnover.
//!
//! # Design
//!
//! - Each block holds `1 << sub_bits` slots. `alloc` probes pseudo-random
//!   slots with a CAS claim, newest block first (newer blocks are
//!   statistically emptier). If no block yields a slot within the try
//!   budget, a new block is appended under a narrow mutex and the probe
//!   restarts.
//! - Indices, never pointers, cross thread boundaries. Every access
//!   re-validates that the slot is live.
//!
//! # Slot state machine
//!
//! ```text
//!   FREE ──alloc CAS──► RESERVED ──value written──► IN_USE
//!    ▲                                                 │
//!    └──state published──── RESERVED ◄────free CAS─────┘
//! ```
//!
//! `RESERVED` covers the two windows in which the slot is claimed but its
//! value is not valid (being written, or being dropped), so [`Substrate::get`]
//! can assert `IN_USE` without racing initialization or teardown.
//!
//! # Ordering
//!
//! The state flag is an assertion aid, not a publication channel: indices
//! are expected to reach other threads through a release/acquire edge of
//! the owning structure (e.g. the polymer's chain-slot CAS). The flag still
//! uses acquire/release so that `get` on a freshly published index observes
//! the written value.
//!
//! # Errors
//!
//! Double frees, accesses through stale or invalid indices, and block-table
//! exhaustion are programming errors and panic immediately.

use std::cell::{RefCell, UnsafeCell};
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::rng::{splitmix64, XorShift64};

use super::stats::StructureStats;

/// Upper bound on blocks per substrate. Hitting it means `sub_bits` was
/// sized far too small for the workload.
const MAX_BLOCKS: usize = 64;

const SLOT_FREE: u8 = 0;
const SLOT_RESERVED: u8 = 1;
const SLOT_IN_USE: u8 = 2;

// Per-thread probe RNG. Seeded from a shared counter through splitmix64 so
// concurrent allocators walk decorrelated probe sequences.
static PROBE_SEED: AtomicU64 = AtomicU64::new(0x853C49E6748FEA9B);

thread_local! {
    static PROBE_RNG: RefCell<XorShift64> = RefCell::new(XorShift64::new(
        splitmix64(PROBE_SEED.fetch_add(0x9E3779B97F4A7C15, Ordering::Relaxed)),
    ));
}

/// Composite index of an allocated slot: `(block << sub_bits) | slot`.
///
/// [`SubstrateIndex::INVALID`] is the "null" value; it is never returned by
/// `alloc` and is rejected by every accessor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubstrateIndex(usize);

impl SubstrateIndex {
    /// The not-an-index sentinel (top bit set; real indices never reach it).
    pub const INVALID: Self = Self(1 << (usize::BITS - 1));

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    #[inline]
    fn compose(block: usize, slot: usize, sub_bits: u32) -> Self {
        Self((block << sub_bits) | slot)
    }

    #[inline]
    fn block(self, sub_bits: u32) -> usize {
        self.0 >> sub_bits
    }

    #[inline]
    fn slot(self, sub_bits: u32) -> usize {
        self.0 & ((1 << sub_bits) - 1)
    }
}

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// One fixed-capacity block of slots.
struct Block<T> {
    slots: Box<[Slot<T>]>,
    max_tries: u32,
    stats: StructureStats,
}

// SAFETY: a slot's value is only written while the writer holds the
// RESERVED claim (exclusive by CAS), and only read while IN_USE. Moving a
// Block between threads moves the Ts it owns (T: Send); sharing it hands
// out &T across threads (T: Sync) and lets any thread claim/free slots,
// which moves Ts in and out (T: Send).
unsafe impl<T: Send> Send for Block<T> {}
unsafe impl<T: Send + Sync> Sync for Block<T> {}

impl<T> Block<T> {
    fn new(sub_bits: u32, max_tries: u32) -> Self {
        let size = 1usize << sub_bits;
        let slots = (0..size)
            .map(|_| Slot {
                state: AtomicU8::new(SLOT_FREE),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            max_tries,
            stats: StructureStats::new(),
        }
    }

    /// Probe up to `max_tries` random slots for a FREE -> RESERVED claim.
    /// Returns the value untouched if every probe loses.
    fn alloc(&self, value: T, rng: &mut XorShift64) -> Result<usize, T> {
        for tries in 0..self.max_tries {
            let index = rng.next_usize(self.slots.len());
            let slot = &self.slots[index];
            if slot
                .state
                .compare_exchange(
                    SLOT_FREE,
                    SLOT_RESERVED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: the CAS above makes this thread the slot's only
                // owner; nothing reads the value before IN_USE is published.
                unsafe { (*slot.value.get()).write(value) };
                slot.state.store(SLOT_IN_USE, Ordering::Release);
                self.stats.inserted_one(tries);
                return Ok(index);
            }
        }
        Err(value)
    }

    fn free(&self, index: usize) {
        let slot = &self.slots[index];
        if slot
            .state
            .compare_exchange(
                SLOT_IN_USE,
                SLOT_RESERVED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            panic!("substrate double free (slot {index} is not in use)");
        }
        // SAFETY: the IN_USE -> RESERVED transition above grants exclusive
        // ownership; allocators skip RESERVED slots until FREE is published.
        unsafe { (*slot.value.get()).assume_init_drop() };
        slot.state.store(SLOT_FREE, Ordering::Release);
        self.stats.erased_one();
    }

    fn get(&self, index: usize) -> &T {
        let slot = &self.slots[index];
        assert!(
            slot.state.load(Ordering::Acquire) == SLOT_IN_USE,
            "bad substrate index (slot {index} is not in use)"
        );
        // SAFETY: IN_USE slots hold an initialized value, and the value is
        // not dropped or overwritten until a free() that the caller's
        // index-ownership contract forbids while this borrow is live.
        unsafe { (*slot.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == SLOT_IN_USE {
                // SAFETY: &mut self means no outstanding borrows; IN_USE
                // slots hold an initialized value.
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

/// Lock-free arena of fixed-size records, addressed by [`SubstrateIndex`].
pub struct Substrate<T> {
    /// Append-only block table: cells up to `block_count` are initialized.
    blocks: Box<[OnceLock<Block<T>>]>,
    block_count: AtomicUsize,
    /// Guards appends to the block table only; never taken on the hot path.
    grow_lock: Mutex<()>,
    sub_bits: u32,
    max_tries: u32,
}

impl<T> Substrate<T> {
    /// Create a substrate with `1 << sub_bits` slots per block.
    ///
    /// `target_contention` mirrors the owning structure's growth knob; the
    /// per-block try budget is its square, so a block must be heavily
    /// occupied before allocation spills into growth.
    pub fn new(sub_bits: u32, target_contention: u32) -> Self {
        assert!(sub_bits > 0, "sub_bits must be > 0");
        assert!(
            sub_bits < usize::BITS - 8,
            "sub_bits leaves no room for block numbers"
        );
        assert!(target_contention > 0, "target_contention must be > 0");

        let substrate = Self {
            blocks: (0..MAX_BLOCKS).map(|_| OnceLock::new()).collect(),
            block_count: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            sub_bits,
            max_tries: target_contention * target_contention,
        };
        substrate.add_block();
        substrate
    }

    /// Allocate a slot and move `value` into it.
    ///
    /// Probes blocks newest-to-oldest; appends a new block when the try
    /// budget is exhausted everywhere. Never blocks except on the rare
    /// append mutex.
    pub fn alloc(&self, value: T) -> SubstrateIndex {
        PROBE_RNG.with(|cell| {
            let mut rng = cell.borrow_mut();
            let mut value = value;
            loop {
                let count = self.block_count.load(Ordering::Acquire);
                for block_no in (0..count).rev() {
                    match self.block(block_no).alloc(value, &mut rng) {
                        Ok(slot) => {
                            return SubstrateIndex::compose(block_no, slot, self.sub_bits)
                        }
                        Err(rejected) => value = rejected,
                    }
                }
                self.add_block();
            }
        })
    }

    /// Release the slot at `index`, dropping its value.
    ///
    /// # Panics
    /// Panics on the INVALID sentinel, an out-of-range block, or a slot
    /// that is not currently in use (double free).
    pub fn free(&self, index: SubstrateIndex) {
        let (block_no, slot) = self.split(index);
        self.block(block_no).free(slot);
    }

    /// Borrow the value at `index`.
    ///
    /// # Panics
    /// Panics on the INVALID sentinel, an out-of-range block, or a slot
    /// that is not currently in use.
    pub fn get(&self, index: SubstrateIndex) -> &T {
        let (block_no, slot) = self.split(index);
        self.block(block_no).get(slot)
    }

    /// Number of blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }

    /// Total live entries across all blocks.
    pub fn len(&self) -> u64 {
        (0..self.block_count())
            .map(|b| self.block(b).stats.size())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write per-block occupancy/contention reports.
    pub fn print_stats(&self, out: &mut dyn Write, prefix: &str) -> io::Result<()> {
        for block_no in 0..self.block_count() {
            self.block(block_no)
                .stats
                .print_stats(out, &format!("{prefix} {block_no}"))?;
        }
        Ok(())
    }

    fn split(&self, index: SubstrateIndex) -> (usize, usize) {
        assert!(!index.is_invalid(), "bad substrate index (INVALID sentinel)");
        let block_no = index.block(self.sub_bits);
        assert!(
            block_no < self.block_count(),
            "bad substrate index (block {block_no} not allocated)"
        );
        (block_no, index.slot(self.sub_bits))
    }

    fn block(&self, block_no: usize) -> &Block<T> {
        // Cells below block_count are always initialized: add_block sets the
        // cell before publishing the new count with Release.
        self.blocks[block_no]
            .get()
            .expect("published block cell must be initialized")
    }

    fn add_block(&self) {
        let _guard = self.grow_lock.lock().expect("substrate grow lock poisoned");
        let count = self.block_count.load(Ordering::Acquire);
        assert!(
            count < MAX_BLOCKS,
            "substrate block table exhausted ({MAX_BLOCKS} blocks); increase sub_bits"
        );
        let ok = self.blocks[count]
            .set(Block::new(self.sub_bits, self.max_tries))
            .is_ok();
        assert!(ok, "block cell initialized twice");
        self.block_count.store(count + 1, Ordering::Release);
        log::debug!(
            "substrate: appended block {} ({} slots)",
            count,
            1usize << self.sub_bits
        );
    }
}
