//! Lock-free memoization structures: the polymer map, its substrate slab
//! allocator, and the shared occupancy/contention counters.

pub mod map;
pub mod stats;
pub mod substrate;

pub use map::{Monomer, Polymer};
pub use stats::StructureStats;
pub use substrate::{Substrate, SubstrateIndex};
