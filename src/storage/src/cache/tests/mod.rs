//! End-to-end cache tests and shared fixtures.


use shoal_common::file_ids::{StringIdLease, StringIdMap};
use shoal_common::memory::MallocAllocator;

use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::{Arc, Mutex};

use super::{
    AsyncDataCache, AsyncDataCacheBuilder, CachePin, RawFileCacheKey, SsdCache, SsdGroupStats,
    SsdLocation,
};

/// A cache with a private file-id table, plus the leases that keep test keys
/// alive.
pub(super) struct TestCache {
    pub(super) cache: Arc<AsyncDataCache>,
    file_ids: Arc<StringIdMap>,
    leases: Mutex<Vec<StringIdLease>>,
}

impl TestCache {
    pub(super) fn key(&self, path: &str, offset: u64) -> RawFileCacheKey {
        let lease = self.file_ids.lease(path);
        let key = RawFileCacheKey::new(lease.id(), offset);
        self.leases.lock().unwrap().push(lease);
        key
    }
}

pub(super) fn create_cache(capacity_bytes: u64) -> TestCache {
    create_cache_with_ssd(capacity_bytes, None)
}

pub(super) fn create_cache_with_ssd(
    capacity_bytes: u64,
    ssd: Option<Arc<TestSsdCache>>,
) -> TestCache {
    let file_ids = Arc::new(StringIdMap::new());
    let mut builder = AsyncDataCacheBuilder::new()
        .with_allocator(Arc::new(MallocAllocator::new(capacity_bytes)))
        .with_file_ids(Arc::clone(&file_ids));
    if let Some(ssd) = ssd {
        builder = builder.with_ssd_cache(ssd);
    }
    TestCache {
        cache: builder.build(),
        file_ids,
        leases: Mutex::new(Vec::new()),
    }
}

/// Fill an exclusive pin with a deterministic pattern and publish it.
pub(super) fn fill_pin(pin: &CachePin, seed: u8) {
    let size = pin.checked_entry().size();
    let content: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_add(seed)).collect();
    pin.write(0, &content);
    pin.checked_entry().set_exclusive_to_shared();
}

pub(super) fn assert_content(pin: &CachePin, seed: u8) {
    let bytes = pin.copy_to_bytes();
    assert_eq!(bytes.len(), pin.checked_entry().size());
    for (i, byte) in bytes.iter().enumerate() {
        assert_eq!(*byte, (i as u8).wrapping_add(seed), "mismatch at byte {i}");
    }
}

#[derive(Debug, Default)]
pub(super) struct TestGroupStats {
    pub(super) save_all: AtomicBool,
    pub(super) filter_updates: AtomicU64,
}

impl SsdGroupStats for TestGroupStats {
    fn should_save_to_ssd(&self, _group_id: u64, _tracking_id: u64) -> bool {
        self.save_all.load(Ordering::Relaxed)
    }

    fn update_ssd_filter(&self, _target_bytes: u64) {
        self.filter_updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory stand-in for the SSD tier: completes writes synchronously,
/// stamping each entry with an SSD location.
#[derive(Debug)]
pub(super) struct TestSsdCache {
    pub(super) group_stats: TestGroupStats,
    write_in_progress: AtomicBool,
    pub(super) num_writes: AtomicU64,
    pub(super) entries_written: AtomicU64,
    next_offset: AtomicU64,
    max_bytes: u64,
}

impl TestSsdCache {
    pub(super) fn new(save_all: bool) -> Arc<Self> {
        let ssd = Self {
            group_stats: TestGroupStats::default(),
            write_in_progress: AtomicBool::new(false),
            num_writes: AtomicU64::new(0),
            entries_written: AtomicU64::new(0),
            next_offset: AtomicU64::new(0),
            max_bytes: 1 << 30,
        };
        ssd.group_stats.save_all.store(save_all, Ordering::Relaxed);
        Arc::new(ssd)
    }
}

impl SsdCache for TestSsdCache {
    fn start_write(&self) -> bool {
        !self.write_in_progress.swap(true, Ordering::SeqCst)
    }

    fn write_in_progress(&self) -> bool {
        self.write_in_progress.load(Ordering::SeqCst)
    }

    fn write(&self, pins: Vec<CachePin>) {
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        self.entries_written
            .fetch_add(pins.len() as u64, Ordering::Relaxed);
        for pin in &pins {
            let entry = pin.checked_entry();
            let offset = self
                .next_offset
                .fetch_add(entry.size() as u64, Ordering::Relaxed);
            entry.set_ssd_location(Some(SsdLocation { file_num: 1, offset }));
        }
        drop(pins);
        self.write_in_progress.store(false, Ordering::Relaxed);
    }

    fn group_stats(&self) -> &dyn SsdGroupStats {
        &self.group_stats
    }

    fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}
