//! Round-based gang scheduler: a fixed worker pool over a shared
//! lock-free work queue, with distributed idle detection and fan-in
//! dependencies for recursive workloads.

pub mod controls;
pub mod dependency;
pub mod pool;
pub mod thread_allocation;
pub mod work_queue;

pub use controls::AsyncControls;
pub use dependency::WorkDependency;
pub use pool::{AsyncGang, RoundHandle};
pub use thread_allocation::{ThreadAllocation, MAX_WORKER_IDS};
pub use work_queue::{ConsumeStatus, WorkFn, WorkItem, WorkQueue};
