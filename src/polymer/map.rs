//! Lock-free, growable concurrent hash map ("polymer").
//!
//! The map is a list of fixed-size chains of slots; each slot holds either
//! an EMPTY sentinel or a [`SubstrateIndex`] pointing at a [`Monomer`]
//! record in the backing [`Substrate`]. Readers and writers touch chain
//! slots only through atomic loads and CAS; the single mutex guards the
//! rare chain append.
//!
//! # Probe order
//!
//! A key's hash is swizzled per chain (rotated by `chain * hash_bits`) so
//! that a cluster in one chain spreads out in the next, then offset by the
//! hop number:
//!
//! ```text
//! offset(chain, hop, hash) = (rotl(hash, chain * hash_bits) + hop) & (chain_len - 1)
//! ```
//!
//! Lookups and inserts walk `(hop, chain)` in the same order, so the first
//! occupied match a reader sees is the same slot a writer would have found
//! free first.
//!
//! # Relaxed duplicate semantics
//!
//! Two threads racing to insert the same key may each publish a monomer for
//! it. Later lookups return whichever copy sits earlier in probe order.
//! This is deliberate: tolerating the rare duplicate keeps inserts
//! non-blocking. Callers needing cross-thread accumulation must therefore
//! key their mutations through the reference they hold, not re-look-up and
//! assume a single canonical entry.
//!
//! # Growth
//!
//! When an insert exhausts every `(hop, chain)` slot, a chain is appended
//! unconditionally and the search restarts at the new chain. Chains are
//! never removed.

use std::hash::{BuildHasher, Hash};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use super::stats::StructureStats;
use super::substrate::{Substrate, SubstrateIndex};

/// Upper bound on chains. Hitting it means `hash_bits` was sized far too
/// small for the key population.
const MAX_CHAINS: usize = 64;

/// The empty-slot sentinel: the raw form of the invalid substrate index.
const EMPTY_SLOT: usize = SubstrateIndex::INVALID.raw();

/// A single key/value record. The key is written once at creation; the
/// value is mutated only through the shared reference handed to callers
/// (use interior mutability for cross-thread accumulation).
#[derive(Debug)]
pub struct Monomer<K, V> {
    pub key: K,
    pub value: V,
}

type Chain = Box<[AtomicUsize]>;

/// Lock-free insert-or-get hash map backed by a [`Substrate`].
pub struct Polymer<K, V, S = ahash::RandomState> {
    /// Append-only chain table: cells up to `chain_count` are initialized.
    chains: Box<[OnceLock<Chain>]>,
    chain_count: AtomicUsize,
    /// Guards chain appends only; never taken by lookups or slot CAS.
    grow_lock: Mutex<()>,
    substrate: Substrate<Monomer<K, V>>,
    hash_bits: u32,
    target_contention: u32,
    stats: StructureStats,
    hasher: S,
}

impl<K, V> Polymer<K, V, ahash::RandomState>
where
    K: Copy + Eq + Hash,
    V: Default,
{
    /// Create a polymer with chains of `1 << hash_bits` slots, growing when
    /// an insert cannot be placed within `target_contention` hops.
    pub fn new(hash_bits: u32, target_contention: u32) -> Self {
        Self::with_hasher(hash_bits, target_contention, ahash::RandomState::new())
    }
}

impl<K, V, S> Polymer<K, V, S>
where
    K: Copy + Eq + Hash,
    V: Default,
    S: BuildHasher,
{
    pub fn with_hasher(hash_bits: u32, target_contention: u32, hasher: S) -> Self {
        assert!(hash_bits > 0, "hash_bits must be > 0");
        assert!(hash_bits <= 24, "hash_bits over 24 makes absurd chains");
        assert!(target_contention > 0, "target_contention must be > 0");

        let polymer = Self {
            chains: (0..MAX_CHAINS).map(|_| OnceLock::new()).collect(),
            chain_count: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            substrate: Substrate::new(hash_bits, target_contention),
            hash_bits,
            target_contention,
            stats: StructureStats::new(),
            hasher,
        };
        polymer.add_chain();
        polymer
    }

    /// Insert-or-get: the value for `key`, creating a default-initialized
    /// entry on first access.
    ///
    /// The returned borrow is valid for the life of the map: entries are
    /// never removed in this design.
    pub fn entry(&self, key: K) -> &V {
        let hash = self.hasher.hash_one(key);
        if let Some(value) = self.find(hash, &key) {
            return value;
        }
        let index = self.substrate.alloc(Monomer {
            key,
            value: V::default(),
        });
        self.publish(hash, index)
    }

    /// Lookup without inserting.
    pub fn get(&self, key: K) -> Option<&V> {
        let hash = self.hasher.hash_one(key);
        self.find(hash, &key)
    }

    /// Number of published entries (duplicates included).
    pub fn len(&self) -> u64 {
        self.stats.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chains currently published. Strictly increases as the map
    /// outgrows its probe space.
    pub fn chain_count(&self) -> usize {
        self.chain_count.load(Ordering::Acquire)
    }

    /// Write occupancy/contention reports for the map and its substrate.
    pub fn print_stats(&self, out: &mut dyn Write, prefix: &str) -> io::Result<()> {
        self.stats.print_stats(out, &format!("{prefix}: polymer"))?;
        writeln!(out, "{prefix}: polymer: chains: {}", self.chain_count())?;
        self.substrate
            .print_stats(out, &format!("{prefix}: substrate"))
    }

    #[inline]
    fn chain_len(&self) -> usize {
        1 << self.hash_bits
    }

    /// Per-chain swizzled probe offset.
    #[inline]
    fn offset(&self, chain_no: usize, hop: u32, hash: u64) -> usize {
        let rotation = (chain_no as u32).wrapping_mul(self.hash_bits) % u64::BITS;
        let swizzled = hash.rotate_left(rotation) as usize;
        swizzled.wrapping_add(hop as usize) & (self.chain_len() - 1)
    }

    fn chain(&self, chain_no: usize) -> &Chain {
        // Cells below chain_count are always initialized: add_chain sets
        // the cell before publishing the new count with Release.
        self.chains[chain_no]
            .get()
            .expect("published chain cell must be initialized")
    }

    /// Walk `(hop, chain)` in probe order looking for `key`.
    fn find(&self, hash: u64, key: &K) -> Option<&V> {
        let count = self.chain_count.load(Ordering::Acquire);
        for hop in 0..self.target_contention {
            for chain_no in 0..count {
                let slot = &self.chain(chain_no)[self.offset(chain_no, hop, hash)];
                let raw = slot.load(Ordering::Acquire);
                if raw == EMPTY_SLOT {
                    continue;
                }
                let monomer = self.substrate.get(SubstrateIndex::from_raw(raw));
                if monomer.key == *key {
                    return Some(&monomer.value);
                }
            }
        }
        None
    }

    /// CAS the freshly allocated record into the first free probe slot,
    /// growing the chain list whenever the whole probe space is occupied.
    fn publish(&self, hash: u64, index: SubstrateIndex) -> &V {
        let mut first_chain = 0;
        loop {
            let count = self.chain_count.load(Ordering::Acquire);
            for hop in 0..self.target_contention {
                for chain_no in first_chain..count {
                    let slot = &self.chain(chain_no)[self.offset(chain_no, hop, hash)];
                    if slot
                        .compare_exchange(
                            EMPTY_SLOT,
                            index.raw(),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        self.stats.inserted_one(hop);
                        return &self.substrate.get(index).value;
                    }
                }
            }
            // Probe space exhausted: append a chain and restart the search
            // there (older chains are already known to be full for this key).
            first_chain = self.add_chain();
        }
    }

    /// Append one chain, returning its index.
    fn add_chain(&self) -> usize {
        let _guard = self.grow_lock.lock().expect("polymer grow lock poisoned");
        let count = self.chain_count.load(Ordering::Acquire);
        assert!(
            count < MAX_CHAINS,
            "polymer chain table exhausted ({MAX_CHAINS} chains); increase hash_bits"
        );
        let chain: Chain = (0..self.chain_len())
            .map(|_| AtomicUsize::new(EMPTY_SLOT))
            .collect();
        let ok = self.chains[count].set(chain).is_ok();
        assert!(ok, "chain cell initialized twice");
        self.chain_count.store(count + 1, Ordering::Release);
        log::debug!(
            "polymer: appended chain {} ({} slots)",
            count,
            self.chain_len()
        );
        count
    }
}
