//! The cache: sharded entries, pins, eviction, coalesced loads.

mod coalesce_io;
mod coalesced_load;
mod core;
mod entry;
mod pin;
mod promise;
mod shard;
mod ssd;
mod stats;
#[cfg(test)]
mod tests;

pub use coalesce_io::{CoalesceIoStats, IoRange, coalesce_io, read_pins};
pub use coalesced_load::{CoalescedLoad, CoalescedLoader, LoadState};
pub use core::{AsyncDataCache, AsyncDataCacheBuilder, NUM_SHARDS};
pub use entry::{CacheEntry, FileCacheKey, RawFileCacheKey, TINY_DATA_SIZE};
pub use pin::CachePin;
pub use promise::{SharedFuture, SharedPromise};
pub use ssd::{SsdCache, SsdGroupStats, SsdLocation};
pub use stats::CacheStats;
