use std::sync::{
    Mutex, Weak,
    atomic::{AtomicUsize, Ordering},
};

use super::allocation::{Allocation, MachinePageCount, PAGE_SIZE, PageRun};

/// Largest single run handed out by [`MallocAllocator`], in pages (256 KiB).
/// Allocations above this are split so they are genuinely non-contiguous.
pub const MAX_RUN_PAGES: MachinePageCount = 64;

/// A cache that can be asked to give memory back to its allocator.
pub trait ShrinkableCache: Send + Sync {
    /// Evict unpinned content until roughly `target_bytes` have been freed.
    /// Returns the number of bytes actually freed.
    fn shrink(&self, target_bytes: u64) -> u64;
}

/// Provider of page-granular memory for cache entries.
///
/// The allocator only accounts capacity; arbitration between competing
/// allocations is the cache's job (`make_space`). Implementations must be
/// safe to call from any thread and must not call back into the cache from
/// `allocate_pages` or `free`.
pub trait PageAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate `num_pages` into `out`, possibly as several runs. Returns
    /// false with no side effects if capacity does not cover the request.
    /// `out` must be empty.
    fn allocate_pages(&self, num_pages: MachinePageCount, out: &mut Allocation) -> bool;

    /// Return all pages of `allocation` and leave it empty.
    fn free(&self, allocation: &mut Allocation);

    fn capacity_pages(&self) -> MachinePageCount;

    fn num_allocated_pages(&self) -> MachinePageCount;

    /// Register the cache that fronts this allocator, so external memory
    /// users can ask it to shed pages.
    fn register_cache(&self, cache: Weak<dyn ShrinkableCache>);
}

/// Heap-backed [`PageAllocator`] with a fixed page capacity.
pub struct MallocAllocator {
    capacity_pages: MachinePageCount,
    allocated_pages: AtomicUsize,
    cache: Mutex<Option<Weak<dyn ShrinkableCache>>>,
}

impl std::fmt::Debug for MallocAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocAllocator")
            .field("capacity_pages", &self.capacity_pages)
            .field("allocated_pages", &self.allocated_pages.load(Ordering::Relaxed))
            .finish()
    }
}

impl MallocAllocator {
    /// Create an allocator with `capacity_bytes` rounded down to whole pages.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_pages: (capacity_bytes as usize) / PAGE_SIZE,
            allocated_pages: AtomicUsize::new(0),
            cache: Mutex::new(None),
        }
    }

    /// The cache registered via [`PageAllocator::register_cache`], if alive.
    pub fn registered_cache(&self) -> Option<std::sync::Arc<dyn ShrinkableCache>> {
        self.cache.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn try_reserve(&self, num_pages: MachinePageCount) -> bool {
        let mut allocated = self.allocated_pages.load(Ordering::Relaxed);
        loop {
            if allocated + num_pages > self.capacity_pages {
                return false;
            }
            match self.allocated_pages.compare_exchange(
                allocated,
                allocated + num_pages,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => allocated = current,
            }
        }
    }
}

impl PageAllocator for MallocAllocator {
    fn allocate_pages(&self, num_pages: MachinePageCount, out: &mut Allocation) -> bool {
        debug_assert!(out.is_empty(), "allocate_pages into a non-empty allocation");
        if num_pages == 0 {
            return true;
        }
        if !self.try_reserve(num_pages) {
            log::debug!(
                "allocation of {num_pages} pages denied, {} of {} in use",
                self.allocated_pages.load(Ordering::Relaxed),
                self.capacity_pages
            );
            return false;
        }
        let mut remaining = num_pages;
        while remaining > 0 {
            let run_pages = remaining.min(MAX_RUN_PAGES);
            out.push_run(PageRun::new(run_pages));
            remaining -= run_pages;
        }
        true
    }

    fn free(&self, allocation: &mut Allocation) {
        let pages = allocation.num_pages();
        if pages == 0 {
            return;
        }
        drop(allocation.take_runs());
        self.allocated_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    fn capacity_pages(&self) -> MachinePageCount {
        self.capacity_pages
    }

    fn num_allocated_pages(&self) -> MachinePageCount {
        self.allocated_pages.load(Ordering::Relaxed)
    }

    fn register_cache(&self, cache: Weak<dyn ShrinkableCache>) {
        *self.cache.lock().unwrap() = Some(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_free() {
        let allocator = MallocAllocator::new(10 * PAGE_SIZE as u64);
        let mut a = Allocation::new();
        assert!(allocator.allocate_pages(4, &mut a));
        assert_eq!(allocator.num_allocated_pages(), 4);
        assert_eq!(a.num_pages(), 4);

        let mut b = Allocation::new();
        assert!(allocator.allocate_pages(6, &mut b));
        assert_eq!(allocator.num_allocated_pages(), 10);

        // Full: the next request fails with no side effects.
        let mut c = Allocation::new();
        assert!(!allocator.allocate_pages(1, &mut c));
        assert!(c.is_empty());
        assert_eq!(allocator.num_allocated_pages(), 10);

        allocator.free(&mut a);
        assert_eq!(allocator.num_allocated_pages(), 6);
        assert!(allocator.allocate_pages(1, &mut c));

        allocator.free(&mut b);
        allocator.free(&mut c);
        assert_eq!(allocator.num_allocated_pages(), 0);
    }

    #[test]
    fn test_large_allocations_split_into_runs() {
        let allocator = MallocAllocator::new(1 << 30);
        let mut a = Allocation::new();
        assert!(allocator.allocate_pages(MAX_RUN_PAGES * 2 + 3, &mut a));
        assert_eq!(a.num_runs(), 3);
        assert_eq!(a.num_pages(), MAX_RUN_PAGES * 2 + 3);
        assert!(a.runs().iter().all(|r| r.num_pages() <= MAX_RUN_PAGES));
        allocator.free(&mut a);
    }

    #[test]
    fn test_zero_page_request() {
        let allocator = MallocAllocator::new(PAGE_SIZE as u64);
        let mut a = Allocation::new();
        assert!(allocator.allocate_pages(0, &mut a));
        assert!(a.is_empty());
        assert_eq!(allocator.num_allocated_pages(), 0);
    }

    #[test]
    fn test_concurrent_reservation_never_oversubscribes() {
        use std::sync::Arc;
        let allocator = Arc::new(MallocAllocator::new(64 * PAGE_SIZE as u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let mut a = Allocation::new();
                    if allocator.allocate_pages(8, &mut a) {
                        assert!(allocator.num_allocated_pages() <= allocator.capacity_pages());
                        allocator.free(&mut a);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(allocator.num_allocated_pages(), 0);
    }
}
