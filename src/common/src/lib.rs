//! Shared services for the shoal cache.
//!
//! This crate holds the leaf dependencies of the cache engine: the interned
//! file-id table that cache keys reference, and the machine-page allocation
//! model (runs, allocations, and the allocator contract).

pub mod file_ids;
pub mod memory;

pub use file_ids::{StringIdLease, StringIdMap, file_ids};
pub use memory::{Allocation, MachinePageCount, PAGE_SIZE, PageAllocator, PageRun};
