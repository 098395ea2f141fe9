//! The cache: shard fan-out, allocate-or-evict arbitration, SSD-save driver.

use std::time::Duration;

use ahash::RandomState;
use shoal_common::file_ids::{StringIdMap, file_ids};
use shoal_common::memory::{
    Allocation, MachinePageCount, MallocAllocator, PageAllocator, ShrinkableCache, page_bytes,
    pages_for_bytes,
};

use crate::CacheError;
use crate::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, Weak, thread};

use super::entry::RawFileCacheKey;
use super::pin::CachePin;
use super::promise::SharedFuture;
use super::shard::CacheShard;
use super::ssd::SsdCache;
use super::stats::CacheStats;

/// Number of shards. Power of two; the low bits of the key hash pick one.
pub const NUM_SHARDS: usize = 4;

const SHARD_MASK: usize = NUM_SHARDS - 1;

const MAX_ATTEMPTS: usize = NUM_SHARDS * 4;

/// Evict at least 1MB even for small allocations, to avoid constantly
/// re-entering the mutex-protected evict loop.
const MIN_EVICT_PAGES: MachinePageCount = 256;

/// Requests below this (8MB) over-evict up to 4x rather than loop.
const SMALL_SIZE_PAGES: MachinePageCount = 2048;

/// Save at least 16MB to SSD at a time.
const MIN_SSD_SAVE_PAGES: MachinePageCount = 4096;

/// A sharded in-memory cache of file regions, fronting slower backing
/// storage. See the crate docs for the entry/pin discipline.
///
/// Example:
/// ```rust
/// use shoal_storage::cache::{AsyncDataCacheBuilder, RawFileCacheKey};
/// use shoal_common::file_ids::file_ids;
///
/// let cache = AsyncDataCacheBuilder::new().build();
/// let file = file_ids().lease("data/part-0.orc");
/// let key = RawFileCacheKey::new(file.id(), 0);
///
/// let pin = cache.find_or_create(key, 4096, None).unwrap();
/// pin.write(0, b"hello");
/// pin.checked_entry().set_exclusive_to_shared();
/// assert!(cache.exists(key));
/// ```
pub struct AsyncDataCache {
    shards: Vec<Arc<CacheShard>>,
    allocator: Arc<dyn PageAllocator>,
    ssd: Option<Arc<dyn SsdCache>>,
    file_ids: Arc<StringIdMap>,
    hash: RandomState,
    backoff_hash: RandomState,
    cached_pages: AtomicI64,
    prefetch_pages: AtomicI64,
    new_bytes: AtomicU64,
    next_ssd_score_bytes: AtomicU64,
    ssd_saveable_bytes: AtomicU64,
    threads_in_allocate: AtomicI32,
    backoff_counter: AtomicU64,
    shard_counter: AtomicUsize,
    num_skipped_saves: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl std::fmt::Debug for AsyncDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDataCache")
            .field("num_shards", &self.shards.len())
            .field("cached_pages", &self.cached_pages.load(Ordering::Relaxed))
            .field("allocated_pages", &self.allocator.num_allocated_pages())
            .field("ssd", &self.ssd)
            .finish()
    }
}

impl AsyncDataCache {
    fn shard_for(&self, key: RawFileCacheKey) -> &Arc<CacheShard> {
        let hash = self.hash.hash_one(key) as usize;
        &self.shards[hash & SHARD_MASK]
    }

    /// Look up or start filling the entry for `key`.
    ///
    /// Returns a shared pin on a hit, or an exclusive pin on a miss; the
    /// caller must fill it and call `set_exclusive_to_shared`, or drop it to
    /// cancel. When another thread holds the entry exclusive, returns an
    /// empty pin; with `wait` supplied, it also receives a future that
    /// resolves when the entry should be re-probed.
    pub fn find_or_create(
        &self,
        key: RawFileCacheKey,
        size: u64,
        wait: Option<&mut Option<SharedFuture>>,
    ) -> Result<CachePin, CacheError> {
        self.shard_for(key).find_or_create(self, key, size, wait)
    }

    /// Presence probe; touches the entry's access stats if present.
    pub fn exists(&self, key: RawFileCacheKey) -> bool {
        self.shard_for(key).exists(key)
    }

    /// Try to satisfy an allocation of `num_pages`, evicting from the shards
    /// as needed. `allocate` receives pages already reclaimed in place and
    /// returns whether it succeeded.
    ///
    /// There is no global lock: memory arbitration must not nest inside a
    /// process-wide mutex, because eviction calls back into the allocator.
    /// Contending threads self-organize into a rank order through an atomic
    /// counter and randomized backoff; lower ranks sleep less and usually
    /// win, which approximates FIFO.
    pub fn make_space(
        &self,
        num_pages: MachinePageCount,
        mut allocate: impl FnMut(&mut Allocation) -> bool,
    ) -> bool {
        let mut size_multiplier = 1.2f64;
        // True once this thread counts in `threads_in_allocate`.
        let mut is_counted = false;
        // Arrival-order rank when contention forces serialization.
        let mut rank: i32 = 0;
        // Pages reclaimed in place by eviction.
        let mut acquired = Allocation::new();

        let threads = self.threads_in_allocate.load(Ordering::Relaxed);
        debug_assert!(
            (0..10_000).contains(&threads),
            "leak in threads_in_allocate: {threads}"
        );
        if threads > 0 {
            // Advisory gate; the rank is corrected after each backoff.
            rank = self.threads_in_allocate.fetch_add(1, Ordering::AcqRel) + 1;
            is_counted = true;
        }

        let mut success = false;
        for nth_attempt in 0..MAX_ATTEMPTS {
            if self.can_try_allocate(num_pages, &acquired) && allocate(&mut acquired) {
                success = true;
                break;
            }
            if nth_attempt > 2 && self.ssd.as_ref().is_some_and(|ssd| ssd.write_in_progress()) {
                // The save holds pins; waiting lets them drop.
                log::info!("pausing 0.5s after failed eviction for SSD write to unpin memory");
                thread::sleep(Duration::from_millis(500));
            }
            if nth_attempt > MAX_ATTEMPTS / 2 && !is_counted {
                rank = self.threads_in_allocate.fetch_add(1, Ordering::AcqRel) + 1;
                is_counted = true;
            }
            if rank > 0 {
                // Free the grabbed pages before sleeping so contenders can
                // make progress.
                self.allocator.free(&mut acquired);
                self.backoff(nth_attempt as i32 + rank);
                // Competing threads may have finished; maybe improve rank.
                rank = rank.min(self.threads_in_allocate.load(Ordering::Relaxed).max(1));
            }
            let shard_index = self
                .shard_counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1)
                & SHARD_MASK;
            let pages_to_acquire = num_pages.saturating_sub(acquired.num_pages());
            let target_bytes =
                (page_bytes(MIN_EVICT_PAGES.max(num_pages)) as f64 * size_multiplier) as u64;
            // Once every shard has been tried, go desperate.
            self.shards[shard_index].evict(
                self,
                target_bytes,
                nth_attempt >= NUM_SHARDS,
                pages_to_acquire,
                &mut acquired,
            );
            if num_pages < SMALL_SIZE_PAGES && size_multiplier < 4.0 {
                size_multiplier *= 2.0;
            }
            crate::utils::yield_now_if_shuttle();
        }
        if !success {
            let message = format!(
                "failed to make space for {num_pages} pages; allocated {} of {} pages\n{}",
                self.allocator.num_allocated_pages(),
                self.allocator.capacity_pages(),
                self.refresh_stats()
            );
            log::warn!("{message}");
            *self.last_failure.lock().unwrap() = Some(message);
        }
        self.allocator.free(&mut acquired);
        if is_counted {
            self.threads_in_allocate.fetch_sub(1, Ordering::AcqRel);
        }
        success
    }

    /// Allocate `num_pages` into `out` through the allocate-or-evict loop.
    /// This is the path entry fills take; shard pressure surfaces here.
    pub fn allocate_pages(&self, num_pages: MachinePageCount, out: &mut Allocation) -> bool {
        self.make_space(num_pages, |acquired| {
            // Reclaimed pages go back through the allocator before the
            // retry, so the allocation below sees the freed capacity.
            self.allocator.free(acquired);
            self.allocator.allocate_pages(num_pages, out)
        })
    }

    fn can_try_allocate(&self, num_pages: MachinePageCount, acquired: &Allocation) -> bool {
        if num_pages <= acquired.num_pages() {
            return true;
        }
        num_pages - acquired.num_pages()
            <= self
                .allocator
                .capacity_pages()
                .saturating_sub(self.allocator.num_allocated_pages())
    }

    fn backoff(&self, counter: i32) {
        let seed = self
            .backoff_hash
            .hash_one(self.backoff_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
        let micros = (seed & 0xfff) * (counter as u64 & 0x1f);
        log::debug!("backoff in allocation contention for {micros}us");
        thread::sleep(Duration::from_micros(micros));
    }

    /// Evict every unpinned entry.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut acquired = Allocation::new();
            shard.evict(self, u64::MAX, true, 0, &mut acquired);
            assert!(acquired.is_empty());
        }
    }

    /// Drop all shard-owned entries. Pinned entries survive until their
    /// pins drop.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }

    /// Aggregate counters over all shards.
    pub fn refresh_stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            shard.update_stats(&mut stats);
        }
        stats.num_skipped_saves = self.num_skipped_saves.load(Ordering::Relaxed);
        stats
    }

    /// The message recorded by the last failed [`Self::make_space`], if any.
    pub fn last_failure_message(&self) -> Option<String> {
        self.last_failure.lock().unwrap().clone()
    }

    /// Pages currently held by non-tiny cached buffers.
    pub fn cached_pages(&self) -> i64 {
        self.cached_pages.load(Ordering::Relaxed)
    }

    /// Pages held by prefetched entries not yet consumed.
    pub fn prefetch_pages(&self) -> i64 {
        self.prefetch_pages.load(Ordering::Relaxed)
    }

    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    pub fn ssd_cache(&self) -> Option<&Arc<dyn SsdCache>> {
        self.ssd.as_ref()
    }

    pub(crate) fn allocator_arc(&self) -> Arc<dyn PageAllocator> {
        Arc::clone(&self.allocator)
    }

    pub(crate) fn file_ids(&self) -> &Arc<StringIdMap> {
        &self.file_ids
    }

    pub(crate) fn increment_cached_pages(&self, delta: i64) {
        self.cached_pages.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn increment_prefetch_pages(&self, delta: i64) {
        self.prefetch_pages.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn increment_num_skipped_saves(&self) {
        self.num_skipped_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_num_skipped_saves(&self) -> u64 {
        self.num_skipped_saves.swap(0, Ordering::Relaxed)
    }

    /// Account bytes of a newly filled entry. Every half-cache worth of new
    /// bytes, the SSD admission filter is re-fit to 90% of SSD capacity.
    pub(crate) fn increment_new(&self, bytes: u64) {
        let new_bytes = self.new_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let Some(ssd) = &self.ssd else {
            return;
        };
        if new_bytes > self.next_ssd_score_bytes.load(Ordering::Relaxed) {
            let cached_bytes = page_bytes(self.cached_pages().max(0) as MachinePageCount);
            self.next_ssd_score_bytes
                .store(new_bytes + cached_bytes.max(1 << 28), Ordering::Relaxed);
            ssd.group_stats()
                .update_ssd_filter((ssd.max_bytes() as f64 * 0.9) as u64);
        }
    }

    /// Accumulate saveable bytes; once past `max(16MB, cached/8)`, start an
    /// SSD write if none is running.
    pub(crate) fn possible_ssd_save(&self, bytes: u64) {
        let Some(ssd) = &self.ssd else {
            return;
        };
        let saveable = self.ssd_saveable_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let trigger = MIN_SSD_SAVE_PAGES.max(self.cached_pages().max(0) as MachinePageCount / 8);
        if pages_for_bytes(saveable) > trigger {
            // Do not start a new save while another is in progress.
            if !ssd.start_write() {
                return;
            }
            self.save_to_ssd();
        }
    }

    /// Collect saveable pins from every shard and hand the batch to the SSD
    /// tier. The tier must already hold the write slot.
    pub fn save_to_ssd(&self) {
        let Some(ssd) = &self.ssd else {
            return;
        };
        assert!(ssd.write_in_progress());
        self.ssd_saveable_bytes.store(0, Ordering::Relaxed);
        let mut pins: Vec<CachePin> = Vec::new();
        for shard in &self.shards {
            shard.append_ssd_saveable(&mut pins);
        }
        ssd.write(pins);
    }
}

impl ShrinkableCache for AsyncDataCache {
    fn shrink(&self, target_bytes: u64) -> u64 {
        let before = self.allocator.num_allocated_pages();
        let per_shard = (target_bytes / NUM_SHARDS as u64).max(page_bytes(MIN_EVICT_PAGES));
        for shard in &self.shards {
            let mut acquired = Allocation::new();
            shard.evict(self, per_shard, false, 0, &mut acquired);
            debug_assert!(acquired.is_empty());
            let freed = before.saturating_sub(self.allocator.num_allocated_pages());
            if page_bytes(freed) >= target_bytes {
                break;
            }
        }
        page_bytes(before.saturating_sub(self.allocator.num_allocated_pages()))
    }
}

/// Builder for [`AsyncDataCache`].
///
/// Example:
/// ```rust
/// use std::sync::Arc;
/// use shoal_common::memory::MallocAllocator;
/// use shoal_storage::cache::AsyncDataCacheBuilder;
///
/// let cache = AsyncDataCacheBuilder::new()
///     .with_allocator(Arc::new(MallocAllocator::new(256 * 1024 * 1024)))
///     .build();
/// ```
pub struct AsyncDataCacheBuilder {
    allocator: Option<Arc<dyn PageAllocator>>,
    ssd: Option<Arc<dyn SsdCache>>,
    file_ids: Option<Arc<StringIdMap>>,
}

impl Default for AsyncDataCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDataCacheBuilder {
    pub fn new() -> Self {
        Self {
            allocator: None,
            ssd: None,
            file_ids: None,
        }
    }

    /// Set the page allocator. Default is a [`MallocAllocator`] with 1GB of
    /// capacity.
    pub fn with_allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Attach an SSD tier. Default is none.
    pub fn with_ssd_cache(mut self, ssd: Arc<dyn SsdCache>) -> Self {
        self.ssd = Some(ssd);
        self
    }

    /// Use a private file-id table instead of the process-wide one.
    pub fn with_file_ids(mut self, file_ids: Arc<StringIdMap>) -> Self {
        self.file_ids = Some(file_ids);
        self
    }

    /// Build the cache and register it with its allocator.
    pub fn build(self) -> Arc<AsyncDataCache> {
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(MallocAllocator::new(1 << 30)));
        let table = self.file_ids.unwrap_or_else(|| Arc::clone(file_ids()));
        let cache = Arc::new_cyclic(|weak: &Weak<AsyncDataCache>| AsyncDataCache {
            shards: (0..NUM_SHARDS)
                .map(|_| Arc::new(CacheShard::new(weak.clone())))
                .collect(),
            allocator: Arc::clone(&allocator),
            ssd: self.ssd,
            file_ids: table,
            hash: RandomState::new(),
            backoff_hash: RandomState::new(),
            cached_pages: AtomicI64::new(0),
            prefetch_pages: AtomicI64::new(0),
            new_bytes: AtomicU64::new(0),
            next_ssd_score_bytes: AtomicU64::new(0),
            ssd_saveable_bytes: AtomicU64::new(0),
            threads_in_allocate: AtomicI32::new(0),
            backoff_counter: AtomicU64::new(0),
            shard_counter: AtomicUsize::new(0),
            num_skipped_saves: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        });
        let cache_dyn: Arc<dyn ShrinkableCache> = cache.clone();
        let shrinker: Weak<dyn ShrinkableCache> = Arc::downgrade(&cache_dyn);
        allocator.register_cache(shrinker);
        cache
    }
}
