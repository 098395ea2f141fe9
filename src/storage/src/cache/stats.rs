//! Aggregated cache counters.

/// Snapshot of cache state and activity, aggregated over all shards by
/// [`AsyncDataCache::refresh_stats`].
///
/// [`AsyncDataCache::refresh_stats`]: super::AsyncDataCache::refresh_stats
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Entries holding cached content.
    pub num_entries: u64,
    /// Empty slots plus entries whose key has been cleared.
    pub num_empty_entries: u64,
    /// Entries currently exclusive (being filled).
    pub num_exclusive: u64,
    /// Entries with at least one reader pin.
    pub num_shared: u64,
    /// Bytes held by exclusive entries.
    pub exclusive_pinned_bytes: u64,
    /// Bytes held by reader-pinned entries.
    pub shared_pinned_bytes: u64,
    /// Bytes in tiny inline buffers.
    pub tiny_size: u64,
    /// Logical bytes in page-backed entries.
    pub large_size: u64,
    /// Page-rounding overhead of page-backed entries.
    pub large_padding: u64,
    /// Prefetched entries not yet consumed.
    pub num_prefetch: u64,
    /// Bytes of unconsumed prefetches.
    pub prefetch_bytes: u64,
    /// Lookup hits.
    pub num_hit: u64,
    /// Bytes served from hits.
    pub hit_bytes: u64,
    /// New entries created (misses).
    pub num_new: u64,
    /// Entries evicted.
    pub num_evict: u64,
    /// Slots examined by eviction passes.
    pub num_evict_checks: u64,
    /// Lookups that found an exclusive entry and had to wait.
    pub num_wait_exclusive: u64,
    /// Sum of scores of evicted entries.
    pub sum_evict_score: u64,
    /// Evictions skipped because the entry awaited an SSD save.
    pub num_saveable_skipped: u64,
    /// SSD saves not started because a write was already in progress.
    pub num_skipped_saves: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Cache size: {} tiny: {} large: {} padding: {}",
            self.tiny_size + self.large_size + self.large_padding,
            self.tiny_size,
            self.large_size,
            self.large_padding
        )?;
        writeln!(
            f,
            "Cache entries: {} read pins: {} write pins: {} pinned shared: {} pinned exclusive: {} write wait: {} empty entries: {}",
            self.num_entries,
            self.num_shared,
            self.num_exclusive,
            self.shared_pinned_bytes,
            self.exclusive_pinned_bytes,
            self.num_wait_exclusive,
            self.num_empty_entries
        )?;
        writeln!(
            f,
            "Cache access miss: {} hit: {} hit bytes: {} eviction: {} eviction checks: {} saveable skipped: {}",
            self.num_new,
            self.num_hit,
            self.hit_bytes,
            self.num_evict,
            self.num_evict_checks,
            self.num_saveable_skipped
        )?;
        write!(
            f,
            "Prefetch entries: {} bytes: {}",
            self.num_prefetch, self.prefetch_bytes
        )
    }
}
