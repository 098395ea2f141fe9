//! Machine-page allocation model.
//!
//! The cache stores large entries in page-granular, non-contiguous
//! [`Allocation`]s obtained from an external [`PageAllocator`]. The allocator
//! owns capacity accounting; the cache arbitrates who gets pages when the
//! allocator runs dry.

mod allocation;
mod allocator;

pub use allocation::{Allocation, MachinePageCount, PAGE_SIZE, PageRun, page_bytes, pages_for_bytes};
pub use allocator::{MallocAllocator, PageAllocator, ShrinkableCache};
