//! One cache shard: a single-mutex unit owning a key map, a slot vector with
//! a CLOCK hand, an eviction-score calibrator, and a free-entry recycler.

use ahash::{HashMap, HashMapExt};
use shoal_common::memory::{Allocation, MachinePageCount, PAGE_SIZE};

use crate::CacheError;
use crate::sync::{Arc, Mutex, Weak};

use super::core::AsyncDataCache;
use super::entry::{CacheEntry, FileCacheKey, RawFileCacheKey, access_time};
use super::pin::CachePin;
use super::promise::{SharedFuture, SharedPromise};
use super::stats::CacheStats;

/// Cap on the recycler of drained entries; halved when exceeded.
const MAX_FREE_ENTRIES: usize = 32;

/// Threshold value meaning "not calibrated yet".
const NO_THRESHOLD: i32 = i32::MAX;

/// Share of a shard's slots an SSD save batch may pin, in percent. If the
/// SSD is slower than storage reads, a save must not pin the whole shard and
/// stall them.
const MAX_SAVE_PERCENT: usize = 70;

struct ShardState {
    map: HashMap<RawFileCacheKey, Arc<CacheEntry>>,
    /// Owned entries; eviction leaves holes that `empty_slots` tracks.
    slots: Vec<Option<Arc<CacheEntry>>>,
    empty_slots: Vec<usize>,
    free_entries: Vec<Arc<CacheEntry>>,
    clock_hand: usize,
    eviction_threshold: i32,
    /// Lookups since the last threshold calibration.
    event_counter: usize,
    num_hit: u64,
    hit_bytes: u64,
    num_new: u64,
    num_evict: u64,
    num_evict_checks: u64,
    num_wait_exclusive: u64,
    sum_evict_score: u64,
    num_saveable_skipped: u64,
}

impl ShardState {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            empty_slots: Vec::new(),
            free_entries: Vec::new(),
            clock_hand: 0,
            eviction_threshold: NO_THRESHOLD,
            event_counter: 0,
            num_hit: 0,
            hit_bytes: 0,
            num_new: 0,
            num_evict: 0,
            num_evict_checks: 0,
            num_wait_exclusive: 0,
            sum_evict_score: 0,
            num_saveable_skipped: 0,
        }
    }

    /// Re-estimate the eviction threshold as the 80th percentile of up to 10
    /// sampled scores, taken at a fixed stride from the CLOCK hand.
    fn calibrate_threshold(&mut self, now: i32) {
        let num_slots = self.slots.len();
        if num_slots == 0 {
            self.eviction_threshold = NO_THRESHOLD;
            return;
        }
        let num_samples = num_slots.min(10);
        let step = (num_slots / num_samples).max(1);
        let mut index = self.clock_hand % num_slots;
        let mut scores = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            // A vacated slot scores 0 and weighs the percentile down; the
            // hand skips holes cheaply either way.
            scores.push(self.slots[index].as_ref().map_or(0, |e| e.score(now)));
            index = (index + step) % num_slots;
        }
        scores.sort_unstable();
        let rank = (num_samples * 80 / 100).min(num_samples - 1);
        self.eviction_threshold = scores[rank];
    }

    fn try_add_free_entry(&mut self, entry: Arc<CacheEntry>) {
        self.free_entries.push(entry);
        if self.free_entries.len() >= MAX_FREE_ENTRIES {
            self.free_entries.truncate(MAX_FREE_ENTRIES >> 1);
        }
    }
}

/// One of the cache's mutually independent partitions.
pub(crate) struct CacheShard {
    cache: Weak<AsyncDataCache>,
    state: Mutex<ShardState>,
}

impl CacheShard {
    pub(crate) fn new(cache: Weak<AsyncDataCache>) -> Self {
        Self {
            cache,
            state: Mutex::new(ShardState::new()),
        }
    }

    pub(crate) fn cache(&self) -> Option<Arc<AsyncDataCache>> {
        self.cache.upgrade()
    }

    /// Look up `key`, returning a shared pin on a hit, an empty pin (and
    /// optionally a future) when the entry is being filled elsewhere, or a
    /// new exclusive pin the caller must fill.
    pub(crate) fn find_or_create(
        self: &Arc<Self>,
        cache: &AsyncDataCache,
        key: RawFileCacheKey,
        size: u64,
        wait: Option<&mut Option<SharedFuture>>,
    ) -> Result<CachePin, CacheError> {
        let entry_to_init;
        {
            let mut state = self.state.lock().unwrap();
            state.event_counter += 1;
            if let Some(found) = state.map.get(&key).cloned() {
                if found.is_exclusive() {
                    state.num_wait_exclusive += 1;
                    if let Some(wait) = wait {
                        *wait = Some(found.get_future());
                    }
                    return Ok(CachePin::empty());
                }
                if found.size() as u64 >= size {
                    found.touch(access_time());
                    // The entry is in a readable state. Add a pin.
                    if found.is_prefetch() {
                        found.set_first_use(true);
                        found.set_prefetch(false);
                    } else {
                        state.num_hit += 1;
                        state.hit_bytes += found.size() as u64;
                    }
                    found.add_reference();
                    return Ok(CachePin::from_entry(found));
                }
                // Can happen when different load quanta cover the same start
                // offset. The old entry is superseded; its readers keep valid
                // pins, it just stops being findable.
                log::warn!(
                    "requested larger entry: found size {} requested size {}",
                    found.size(),
                    size
                );
                found.clear_key();
            }

            let entry = match state.free_entries.pop() {
                Some(recycled) => {
                    recycled.reset_for_reuse();
                    recycled
                }
                None => Arc::new(CacheEntry::new(Arc::downgrade(self), cache.allocator_arc())),
            };
            entry.begin_exclusive();
            let lease = cache
                .file_ids()
                .lease_by_id(key.file_num)
                .expect("file id not interned");
            entry.set_key(FileCacheKey {
                file_num: lease,
                offset: key.offset,
            });
            debug_assert_eq!(entry.size(), 0);
            entry.set_size(size as usize);
            entry.set_first_use(true);
            state.map.insert(key, Arc::clone(&entry));
            match state.empty_slots.pop() {
                Some(slot) => state.slots[slot] = Some(Arc::clone(&entry)),
                None => state.slots.push(Some(Arc::clone(&entry))),
            }
            state.num_new += 1;
            entry_to_init = entry;
        }
        self.init_entry(cache, entry_to_init, size)
    }

    /// The new entry is in the map in exclusive mode; other threads may
    /// already be waiting on its promise. Only the buffers are touched
    /// outside the mutex.
    fn init_entry(
        &self,
        cache: &AsyncDataCache,
        entry: Arc<CacheEntry>,
        size: u64,
    ) -> Result<CachePin, CacheError> {
        entry.initialize(cache, size as usize)?;
        cache.increment_new(size);
        Ok(CachePin::from_entry(entry))
    }

    /// Presence probe; refreshes access stats on a hit.
    pub(crate) fn exists(&self, key: RawFileCacheKey) -> bool {
        let state = self.state.lock().unwrap();
        match state.map.get(&key) {
            Some(entry) => {
                entry.touch(access_time());
                true
            }
            None => false,
        }
    }

    /// Advance the CLOCK hand, evicting unpinned entries that score at or
    /// above the calibrated threshold until `bytes_to_free` is exceeded.
    /// With `pages_to_acquire > 0`, evicted pages are moved into `acquired`
    /// instead of being freed. A desperate pass (`evict_all_unpinned`)
    /// ignores scores and the SSD bypass rule.
    pub(crate) fn evict(
        &self,
        cache: &AsyncDataCache,
        bytes_to_free: u64,
        evict_all_unpinned: bool,
        mut pages_to_acquire: MachinePageCount,
        acquired: &mut Allocation,
    ) {
        let ssd = cache.ssd_cache();
        let skip_ssd_saveable = ssd.is_some_and(|ssd| ssd.write_in_progress());
        let mut now = access_time();
        let mut to_free: Vec<Allocation> = Vec::new();
        let mut tiny_freed: u64 = 0;
        let mut large_freed: u64 = 0;
        let mut saveable_skipped: u64 = 0;
        {
            let mut state = self.state.lock().unwrap();
            let num_slots = state.slots.len();
            if num_slots == 0 {
                return;
            }
            let mut entry_index = state.clock_hand % num_slots;
            let mut num_checked = 0usize;
            for _ in 0..num_slots {
                entry_index = (entry_index + 1) % num_slots;
                state.num_evict_checks += 1;
                let Some(candidate) = state.slots[entry_index].clone() else {
                    continue;
                };
                num_checked += 1;
                state.clock_hand += 1;
                if state.eviction_threshold == NO_THRESHOLD
                    || state.event_counter > num_slots / 4
                    || num_checked > num_slots / 8
                {
                    now = access_time();
                    state.calibrate_threshold(now);
                    num_checked = 0;
                    state.event_counter = 0;
                }
                if candidate.pin_count() != 0 {
                    continue;
                }
                let mut score = 0;
                let evictable = candidate.key().is_none() || evict_all_unpinned || {
                    score = candidate.score(now);
                    score >= state.eviction_threshold
                };
                if !evictable {
                    continue;
                }
                if skip_ssd_saveable && candidate.is_ssd_saveable() && !evict_all_unpinned {
                    saveable_skipped += 1;
                    continue;
                }
                // SAFETY: unpinned, under the shard lock.
                let mut data = unsafe { candidate.take_data() };
                large_freed += data.byte_size();
                if pages_to_acquire > 0 {
                    pages_to_acquire = pages_to_acquire.saturating_sub(data.num_pages());
                    acquired.append_move(&mut data);
                } else if !data.is_empty() {
                    to_free.push(data);
                }
                Self::remove_entry_locked(Some(cache), &mut state, &candidate);
                state.empty_slots.push(entry_index);
                // SAFETY: same as above.
                tiny_freed += unsafe { candidate.clear_tiny() } as u64;
                candidate.set_size(0);
                let recycled = state.slots[entry_index]
                    .take()
                    .expect("evicted slot already empty");
                state.try_add_free_entry(recycled);
                state.num_evict += 1;
                if score > 0 {
                    state.sum_evict_score += score as u64;
                }
                if large_freed + tiny_freed > bytes_to_free {
                    break;
                }
            }
            state.num_saveable_skipped += saveable_skipped;
        }
        for mut allocation in to_free {
            cache.allocator().free(&mut allocation);
        }
        cache.increment_cached_pages(-((large_freed as usize / PAGE_SIZE) as i64));
        if saveable_skipped > 0 {
            // Rare: only when the SSD is unusually slow. Flush the backlog of
            // saveable entries as soon as the tier accepts a write again.
            if ssd.is_some_and(|ssd| ssd.start_write()) {
                log::info!(
                    "starting save for old saveable entries, {} saves skipped so far",
                    cache.take_num_skipped_saves()
                );
                cache.save_to_ssd();
            } else {
                cache.increment_num_skipped_saves();
            }
        }
    }

    /// Remove `entry` from the shard and hand back its promise for the
    /// caller to fulfil outside the lock.
    pub(crate) fn remove_entry(&self, entry: &CacheEntry) -> Option<SharedPromise> {
        let cache = self.cache.upgrade();
        let mut state = self.state.lock().unwrap();
        Self::remove_entry_locked(cache.as_deref(), &mut state, entry);
        // Off the map, no new promise can be added; safe to move it out.
        entry.take_promise()
    }

    fn remove_entry_locked(
        cache: Option<&AsyncDataCache>,
        state: &mut ShardState,
        entry: &CacheEntry,
    ) {
        let Some(key) = entry.take_key() else {
            // Already unfindable (superseded or previously removed).
            return;
        };
        let removed = state.map.remove(&key.raw());
        assert!(removed.is_some(), "entry missing from shard map");
        drop(key);
        entry.set_ssd_location(None);
        if entry.is_prefetch() {
            entry.set_prefetch(false);
        }
        // An entry can still hold pages if it is removed after a failed
        // fill. Eviction moves the pages out beforehand, so freeing under
        // the shard lock is exceptional.
        // SAFETY: exclusive owner (failed fill) or unpinned under the lock.
        let mut data = unsafe { entry.take_data() };
        if !data.is_empty() {
            if let Some(cache) = cache {
                cache.increment_cached_pages(-(data.num_pages() as i64));
            }
            entry.allocator().free(&mut data);
        }
    }

    /// Take the entry's promise under the shard lock, so no waiter can slip
    /// in a new one during an exclusive-to-shared transition.
    pub(crate) fn move_promise(&self, entry: &CacheEntry) -> Option<SharedPromise> {
        let _state = self.state.lock().unwrap();
        entry.take_promise()
    }

    /// Pin every shared, saveable, not-yet-persisted entry for an SSD write
    /// batch, up to [`MAX_SAVE_PERCENT`] of the shard's slots.
    pub(crate) fn append_ssd_saveable(&self, pins: &mut Vec<CachePin>) {
        let state = self.state.lock().unwrap();
        let limit = (state.slots.len() * MAX_SAVE_PERCENT) / 100;
        for entry in state.slots.iter().flatten() {
            if entry.ssd_location().is_none() && !entry.is_exclusive() && entry.is_ssd_saveable() {
                entry.add_reference();
                pins.push(CachePin::from_entry(Arc::clone(entry)));
                if pins.len() >= limit {
                    log::info!("limiting SSD save batch to {limit} entries");
                    break;
                }
            }
        }
    }

    pub(crate) fn update_stats(&self, stats: &mut CacheStats) {
        let state = self.state.lock().unwrap();
        for slot in &state.slots {
            let Some(entry) = slot else {
                stats.num_empty_entries += 1;
                continue;
            };
            if entry.key().is_none() {
                stats.num_empty_entries += 1;
                continue;
            }
            let held_bytes = (entry.data_bytes() + entry.tiny_bytes()) as u64;
            if entry.is_exclusive() {
                stats.exclusive_pinned_bytes += held_bytes;
                stats.num_exclusive += 1;
            } else if entry.is_shared() {
                stats.shared_pinned_bytes += held_bytes;
                stats.num_shared += 1;
            }
            if entry.is_prefetch() {
                stats.num_prefetch += 1;
                stats.prefetch_bytes += entry.size() as u64;
            }
            stats.num_entries += 1;
            let size = entry.size() as u64;
            if entry.tiny_bytes() > 0 {
                stats.tiny_size += size;
            } else {
                stats.large_size += size;
                stats.large_padding += (entry.data_bytes() as u64).saturating_sub(size);
            }
        }
        stats.num_hit += state.num_hit;
        stats.hit_bytes += state.hit_bytes;
        stats.num_new += state.num_new;
        stats.num_evict += state.num_evict;
        stats.num_evict_checks += state.num_evict_checks;
        stats.num_wait_exclusive += state.num_wait_exclusive;
        stats.sum_evict_score += state.sum_evict_score;
        stats.num_saveable_skipped += state.num_saveable_skipped;
    }

    /// Drop all owned entries. Pinned entries stay alive until their last
    /// pin drops; everything else is freed here.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.map.clear();
        state.slots.clear();
        state.empty_slots.clear();
        state.free_entries.clear();
    }
}
