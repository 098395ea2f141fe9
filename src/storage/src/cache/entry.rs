//! Cache entries and their pin/ownership state machine.
//!
//! An entry is created exclusive (one writer, no readers), filled outside any
//! lock, then published with [`CacheEntry::set_exclusive_to_shared`]. From
//! then on readers pin it with a single atomic increment and never touch the
//! shard mutex. An entry whose key has been cleared is unfindable but stays
//! alive until its last pin drops.

use std::cell::UnsafeCell;
use std::sync::OnceLock;
use std::time::Instant;

use shoal_common::StringIdLease;
use shoal_common::memory::{Allocation, PageAllocator, pages_for_bytes};

use crate::CacheError;
use crate::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, Weak};

use super::core::AsyncDataCache;
use super::promise::{SharedFuture, SharedPromise};
use super::shard::CacheShard;
use super::ssd::SsdLocation;

/// Entries smaller than this keep their bytes inline instead of in
/// page-granular allocations.
pub const TINY_DATA_SIZE: usize = 2048;

/// Pin-count sentinel meaning "exactly one writer, no readers". Large and
/// negative so a racing shared increment can never make it look non-negative.
pub(crate) const EXCLUSIVE: i32 = -10_000;

/// Coarse access clock, in seconds since the first cache operation.
pub(crate) fn access_time() -> i32 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs() as i32
}

/// Lookup key: interned file id plus byte offset in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFileCacheKey {
    /// Id from the file-id table. Never [`shoal_common::file_ids::NO_FILE_ID`].
    pub file_num: u64,
    /// Byte offset of the cached region within the file.
    pub offset: u64,
}

impl RawFileCacheKey {
    pub fn new(file_num: u64, offset: u64) -> Self {
        Self { file_num, offset }
    }
}

/// Owning form of the key: the lease keeps the file id alive for as long as
/// the entry holds it.
#[derive(Debug)]
pub struct FileCacheKey {
    pub file_num: StringIdLease,
    pub offset: u64,
}

impl FileCacheKey {
    pub(crate) fn raw(&self) -> RawFileCacheKey {
        RawFileCacheKey::new(self.file_num.id(), self.offset)
    }
}

#[derive(Debug, Default)]
struct AccessStats {
    last_use: AtomicI32,
    num_uses: AtomicI32,
}

impl AccessStats {
    fn touch(&self, now: i32) {
        self.last_use.store(now, Ordering::Relaxed);
        self.num_uses.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.last_use.store(0, Ordering::Relaxed);
        self.num_uses.store(0, Ordering::Relaxed);
    }

    fn last_use(&self) -> i32 {
        self.last_use.load(Ordering::Relaxed)
    }

    fn num_uses(&self) -> i32 {
        self.num_uses.load(Ordering::Relaxed)
    }
}

/// Fields only touched under the owning shard's mutex.
#[derive(Default)]
pub(crate) struct EntryLocked {
    pub(crate) key: Option<FileCacheKey>,
    pub(crate) promise: Option<SharedPromise>,
    pub(crate) ssd: Option<SsdLocation>,
}

/// The entry's storage: a tiny inline buffer or a page allocation, never both.
#[derive(Default)]
pub(crate) struct EntryBuffers {
    pub(crate) tiny: Vec<u8>,
    pub(crate) data: Allocation,
}

/// One cache record.
pub struct CacheEntry {
    shard: Weak<CacheShard>,
    allocator: Arc<dyn PageAllocator>,
    pin_count: AtomicI32,
    size: AtomicUsize,
    access: AccessStats,
    is_prefetch: AtomicBool,
    is_first_use: AtomicBool,
    ssd_saveable: AtomicBool,
    group_id: AtomicU64,
    tracking_id: AtomicU64,
    /// Mirrors of the buffer footprint, readable without buffer access.
    tiny_bytes: AtomicUsize,
    data_bytes: AtomicUsize,
    locked: Mutex<EntryLocked>,
    buffers: UnsafeCell<EntryBuffers>,
}

// SAFETY: `buffers` is the only field without interior synchronization. It is
// mutated only (a) by the single exclusive owner while
// `pin_count == EXCLUSIVE`, or (b) under the owning shard's mutex while
// `pin_count == 0`. Readers hold a shared pin (`pin_count >= 1`) for the
// whole borrow; the release store in `set_exclusive_to_shared` paired with
// the acquire in `add_reference` orders the buffer contents before any read.
unsafe impl Send for CacheEntry {}
unsafe impl Sync for CacheEntry {}

impl CacheEntry {
    pub(crate) fn new(shard: Weak<CacheShard>, allocator: Arc<dyn PageAllocator>) -> Self {
        Self {
            shard,
            allocator,
            pin_count: AtomicI32::new(0),
            size: AtomicUsize::new(0),
            access: AccessStats::default(),
            is_prefetch: AtomicBool::new(false),
            is_first_use: AtomicBool::new(false),
            ssd_saveable: AtomicBool::new(false),
            group_id: AtomicU64::new(0),
            tracking_id: AtomicU64::new(0),
            tiny_bytes: AtomicUsize::new(0),
            data_bytes: AtomicUsize::new(0),
            locked: Mutex::new(EntryLocked::default()),
            buffers: UnsafeCell::new(EntryBuffers::default()),
        }
    }

    /// Logical byte length of the cached region.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn is_exclusive(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) == EXCLUSIVE
    }

    pub fn is_shared(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Take another shared reference. Lock-free; the entry must not be
    /// exclusive.
    pub(crate) fn add_reference(&self) {
        let old = self.pin_count.fetch_add(1, Ordering::AcqRel);
        assert!(old >= 0, "add_reference on an exclusive entry");
    }

    /// Drop one reference. An exclusive release means the fill failed: the
    /// entry is unpublished and waiters are woken to re-probe.
    pub(crate) fn release(&self) {
        let pins = self.pin_count.load(Ordering::Acquire);
        assert_ne!(pins, 0, "release on an unpinned entry");
        if pins == EXCLUSIVE {
            let promise = match self.shard.upgrade() {
                Some(shard) => shard.remove_entry(self),
                None => {
                    // Cache torn down mid-fill; nothing to unpublish.
                    self.free_buffers();
                    self.take_promise()
                }
            };
            if let Some(promise) = promise {
                promise.set_value(true);
            }
            self.pin_count.store(0, Ordering::Release);
        } else {
            let old = self.pin_count.fetch_sub(1, Ordering::Release);
            assert!(old >= 1, "pin count goes negative");
        }
    }

    pub(crate) fn begin_exclusive(&self) {
        debug_assert_eq!(self.pin_count.load(Ordering::Acquire), 0);
        self.pin_count.store(EXCLUSIVE, Ordering::Release);
    }

    /// Publish a filled entry: readers may observe the buffer after this.
    /// Wakes waiters and consults the SSD oracle.
    pub fn set_exclusive_to_shared(&self) {
        assert!(self.is_exclusive(), "publish on a non-exclusive entry");
        self.pin_count.store(1, Ordering::Release);
        // Enter the shard's mutex so a promise cannot be added during the
        // move; fulfil it outside.
        let promise = match self.shard.upgrade() {
            Some(shard) => shard.move_promise(self),
            None => self.take_promise(),
        };
        if let Some(promise) = promise {
            promise.set_value(true);
        }

        if self.ssd_location().is_some() {
            return;
        }
        let Some(cache) = self.cache() else { return };
        let Some(ssd) = cache.ssd_cache() else { return };
        if ssd
            .group_stats()
            .should_save_to_ssd(self.group_id(), self.tracking_id())
        {
            self.ssd_saveable.store(true, Ordering::Relaxed);
            cache.possible_ssd_save(self.size() as u64);
        }
    }

    /// Allocate the entry's buffer. Must be exclusive. On allocation failure
    /// the entry is released (removed, waiters woken) and the error is
    /// retriable.
    pub(crate) fn initialize(
        &self,
        cache: &AsyncDataCache,
        size: usize,
    ) -> Result<(), CacheError> {
        assert!(self.is_exclusive(), "initialize on a non-exclusive entry");
        debug_assert_eq!(self.size(), size);
        {
            // SAFETY: we are the exclusive owner.
            let buffers = unsafe { self.buffers_mut() };
            if size < TINY_DATA_SIZE {
                buffers.tiny.resize(size, 0);
                buffers.tiny.shrink_to_fit();
                self.tiny_bytes.store(size, Ordering::Relaxed);
                return Ok(());
            }
            buffers.tiny = Vec::new();
            self.tiny_bytes.store(0, Ordering::Relaxed);
        }
        let num_pages = pages_for_bytes(size as u64);
        let mut data = Allocation::new();
        if cache.allocate_pages(num_pages, &mut data) {
            let allocated_pages = data.num_pages();
            self.data_bytes
                .store(data.byte_size() as usize, Ordering::Relaxed);
            // SAFETY: still the exclusive owner.
            unsafe { self.buffers_mut().data = data };
            cache.increment_cached_pages(allocated_pages as i64);
            Ok(())
        } else {
            // No memory to cover this entry.
            self.release();
            Err(CacheError::NoCacheSpace { bytes: size as u64 })
        }
    }

    /// Zero the access stats so the next eviction pass takes this entry
    /// first.
    pub fn make_evictable(&self) {
        self.access.reset();
    }

    pub(crate) fn touch(&self, now: i32) {
        self.access.touch(now);
    }

    /// Staleness score: higher means a better eviction candidate.
    pub(crate) fn score(&self, now: i32) -> i32 {
        let elapsed = now.saturating_sub(self.access.last_use());
        if self.is_prefetch() {
            // An unconsumed prefetch earns no frequency credit.
            return elapsed;
        }
        elapsed / (1 + self.access.num_uses().max(0))
    }

    pub fn is_prefetch(&self) -> bool {
        self.is_prefetch.load(Ordering::Relaxed)
    }

    /// Flag or unflag the entry as a prefetch, adjusting the cache-wide
    /// prefetched-page counter.
    pub fn set_prefetch(&self, flag: bool) {
        self.is_prefetch.store(flag, Ordering::Relaxed);
        let pages = pages_for_bytes(self.size() as u64) as i64;
        if let Some(cache) = self.cache() {
            cache.increment_prefetch_pages(if flag { pages } else { -pages });
        }
    }

    pub(crate) fn set_first_use(&self, flag: bool) {
        self.is_first_use.store(flag, Ordering::Relaxed);
    }

    /// Read and clear the first-use flag. Consumers use this to distinguish
    /// a first read from a repeat hit.
    pub fn take_first_use(&self) -> bool {
        self.is_first_use.swap(false, Ordering::Relaxed)
    }

    pub fn is_ssd_saveable(&self) -> bool {
        self.ssd_saveable.load(Ordering::Relaxed)
    }

    pub fn group_id(&self) -> u64 {
        self.group_id.load(Ordering::Relaxed)
    }

    pub fn set_group_id(&self, group_id: u64) {
        self.group_id.store(group_id, Ordering::Relaxed);
    }

    pub fn tracking_id(&self) -> u64 {
        self.tracking_id.load(Ordering::Relaxed)
    }

    pub fn set_tracking_id(&self, tracking_id: u64) {
        self.tracking_id.store(tracking_id, Ordering::Relaxed);
    }

    /// Where this entry lives on SSD, if it was loaded from or saved to the
    /// SSD tier.
    pub fn ssd_location(&self) -> Option<SsdLocation> {
        self.locked.lock().unwrap().ssd
    }

    pub fn set_ssd_location(&self, location: Option<SsdLocation>) {
        self.locked.lock().unwrap().ssd = location;
    }

    /// The raw key, or `None` when the entry has been cleared.
    pub fn key(&self) -> Option<RawFileCacheKey> {
        self.locked.lock().unwrap().key.as_ref().map(FileCacheKey::raw)
    }

    pub(crate) fn set_key(&self, key: FileCacheKey) {
        self.locked.lock().unwrap().key = Some(key);
    }

    pub(crate) fn take_key(&self) -> Option<FileCacheKey> {
        self.locked.lock().unwrap().key.take()
    }

    /// Revoke discoverability. Existing pins stay valid; the entry is freed
    /// once the last one drops and an eviction pass collects it.
    pub(crate) fn clear_key(&self) {
        self.locked.lock().unwrap().key = None;
    }

    /// A future for the fill in progress. Caller must hold the shard lock
    /// and have observed the entry exclusive.
    pub(crate) fn get_future(&self) -> SharedFuture {
        let mut locked = self.locked.lock().unwrap();
        locked
            .promise
            .get_or_insert_with(SharedPromise::new)
            .future()
    }

    pub(crate) fn take_promise(&self) -> Option<SharedPromise> {
        self.locked.lock().unwrap().promise.take()
    }

    /// Buffer footprint mirrors, for stats without touching the buffers.
    pub(crate) fn tiny_bytes(&self) -> usize {
        self.tiny_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn data_bytes(&self) -> usize {
        self.data_bytes.load(Ordering::Relaxed)
    }

    /// Reset a recycled entry to its just-constructed state. Caller owns the
    /// entry solely (shard lock, no pins, not in the map).
    pub(crate) fn reset_for_reuse(&self) {
        debug_assert_eq!(self.pin_count.load(Ordering::Acquire), 0);
        self.access.reset();
        self.is_prefetch.store(false, Ordering::Relaxed);
        self.is_first_use.store(false, Ordering::Relaxed);
        self.ssd_saveable.store(false, Ordering::Relaxed);
        self.group_id.store(0, Ordering::Relaxed);
        self.tracking_id.store(0, Ordering::Relaxed);
        let mut locked = self.locked.lock().unwrap();
        locked.promise = None;
        locked.ssd = None;
        debug_assert!(locked.key.is_none());
    }

    /// The allocator that owns this entry's pages.
    pub(crate) fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    fn cache(&self) -> Option<Arc<AsyncDataCache>> {
        self.shard.upgrade().and_then(|shard| shard.cache())
    }

    /// # Safety
    ///
    /// Caller must be the exclusive owner, or hold the shard lock with
    /// `pin_count == 0`.
    pub(crate) unsafe fn buffers_mut(&self) -> &mut EntryBuffers {
        unsafe { &mut *self.buffers.get() }
    }

    /// # Safety
    ///
    /// Caller must hold a pin on the entry.
    pub(crate) unsafe fn buffers(&self) -> &EntryBuffers {
        unsafe { &*self.buffers.get() }
    }

    /// Move the page allocation out, e.g. to transfer it to an eviction's
    /// `acquired` set.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard lock with `pin_count == 0`, or be the
    /// exclusive owner.
    pub(crate) unsafe fn take_data(&self) -> Allocation {
        self.data_bytes.store(0, Ordering::Relaxed);
        std::mem::take(unsafe { &mut self.buffers_mut().data })
    }

    /// Drop the tiny buffer, returning how many bytes it held.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::take_data`].
    pub(crate) unsafe fn clear_tiny(&self) -> usize {
        self.tiny_bytes.store(0, Ordering::Relaxed);
        let buffers = unsafe { self.buffers_mut() };
        let len = buffers.tiny.len();
        buffers.tiny = Vec::new();
        len
    }

    fn free_buffers(&self) {
        // SAFETY: sole owner; called from drop or from a failed fill whose
        // cache is already gone.
        let buffers = unsafe { self.buffers_mut() };
        if !buffers.data.is_empty() {
            self.allocator.free(&mut buffers.data);
        }
        buffers.tiny = Vec::new();
        self.tiny_bytes.store(0, Ordering::Relaxed);
        self.data_bytes.store(0, Ordering::Relaxed);
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.free_buffers();
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<entry key:{:?} size {} pins {}>",
            self.key(),
            self.size(),
            self.pin_count.load(Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::memory::MallocAllocator;

    fn orphan_entry() -> CacheEntry {
        let allocator: Arc<dyn PageAllocator> = Arc::new(MallocAllocator::new(1 << 20));
        CacheEntry::new(Weak::new(), allocator)
    }

    #[test]
    fn test_score_prefers_stale_entries() {
        let entry = orphan_entry();
        entry.touch(100);
        assert_eq!(entry.score(100), 0);
        assert!(entry.score(160) > 0);

        // More uses shrink the score at equal staleness.
        let hot = orphan_entry();
        for _ in 0..9 {
            hot.touch(100);
        }
        assert!(hot.score(160) < entry.score(160));
    }

    #[test]
    fn test_make_evictable_maximizes_score() {
        let entry = orphan_entry();
        entry.touch(access_time());
        entry.make_evictable();
        let now = access_time().max(1);
        assert_eq!(entry.score(now), now);
    }

    #[test]
    fn test_prefetch_score_ignores_uses() {
        let entry = orphan_entry();
        entry.touch(100);
        entry.touch(100);
        entry.is_prefetch.store(true, Ordering::Relaxed);
        assert_eq!(entry.score(130), 30);
    }

    #[test]
    fn test_shared_pin_counting() {
        let entry = orphan_entry();
        entry.begin_exclusive();
        assert!(entry.is_exclusive());
        entry.set_exclusive_to_shared();
        assert!(entry.is_shared());
        assert_eq!(entry.pin_count(), 1);
        entry.add_reference();
        assert_eq!(entry.pin_count(), 2);
        entry.release();
        entry.release();
        assert_eq!(entry.pin_count(), 0);
    }

    #[test]
    #[should_panic(expected = "add_reference on an exclusive entry")]
    fn test_add_reference_on_exclusive_panics() {
        let entry = orphan_entry();
        entry.begin_exclusive();
        entry.add_reference();
    }

    #[test]
    #[should_panic(expected = "release on an unpinned entry")]
    fn test_release_underflow_panics() {
        let entry = orphan_entry();
        entry.release();
    }

    #[test]
    fn test_failed_fill_wakes_waiters() {
        let entry = orphan_entry();
        entry.begin_exclusive();
        let future = entry.get_future();
        entry.release();
        assert_eq!(future.try_value(), Some(true));
        assert_eq!(entry.pin_count(), 0);
    }
}
