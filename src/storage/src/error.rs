use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Invariant violations (pin-count underflow, adding a reference to an
/// exclusive entry, a map entry going missing) are programming errors and
/// panic instead of being reported here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The allocator could not cover an entry's buffer, even after eviction.
    /// Retriable: capacity frees up as pins drop and SSD writes finish.
    #[error("failed to allocate {bytes} bytes for cache")]
    NoCacheSpace {
        /// Size of the entry that could not be allocated.
        bytes: u64,
    },

    /// A coalesced load's fetch failed; waiters were woken and must re-probe.
    #[error("coalesced load failed: {0}")]
    LoadFailed(String),

    /// IO error from a loader's backing read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CacheError::NoCacheSpace { .. })
    }
}
