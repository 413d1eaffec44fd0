//! # Resources
//!
//! Process-wide capacity tracking ([`ResourcePool`]) and the allocator that
//! reserves against it on behalf of orchestration runs.

pub mod allocator;
pub mod pool;

pub use allocator::{CapacitySample, ResourceAllocator};
pub use pool::ResourcePool;
