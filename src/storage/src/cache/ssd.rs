//! Contracts of the secondary persistent tier.
//!
//! The SSD tier is advisory: it absorbs hot evictions and can serve reloads,
//! but the in-memory cache never depends on its contents. The cache drives it
//! through these traits; the tier owns its own persistent layout.

use super::pin::CachePin;

/// Where an entry lives in the SSD tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsdLocation {
    /// Which SSD file holds the entry.
    pub file_num: u32,
    /// Byte offset within that file.
    pub offset: u64,
}

/// Per-file-group admission statistics: decides which entries are worth
/// persisting.
pub trait SsdGroupStats: Send + Sync {
    /// Whether an entry of this group/tracking pair should be saved.
    /// Consulted once, when the entry becomes shared.
    fn should_save_to_ssd(&self, group_id: u64, tracking_id: u64) -> bool;

    /// Re-fit the admission filter to `target_bytes` of SSD capacity.
    fn update_ssd_filter(&self, target_bytes: u64);
}

/// The write side of the SSD tier.
pub trait SsdCache: Send + Sync + std::fmt::Debug {
    /// Begin a write batch. Returns false if one is already in progress;
    /// writes are serialized.
    fn start_write(&self) -> bool;

    fn write_in_progress(&self) -> bool;

    /// Persist a batch of pinned, shared entries. The tier releases the pins
    /// when it is done with them, possibly asynchronously.
    fn write(&self, pins: Vec<CachePin>);

    fn group_stats(&self) -> &dyn SsdGroupStats;

    /// Capacity of the tier, for sizing the admission filter.
    fn max_bytes(&self) -> u64;
}
