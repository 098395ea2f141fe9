//! Scoped references to cache entries.

use bytes::{Bytes, BytesMut};

use crate::sync::Arc;

use super::entry::{CacheEntry, TINY_DATA_SIZE};

/// A scoped reference that keeps an entry resident and readable. Dropping it
/// releases exactly one reference; cloning takes another (shared entries
/// only). Pins are the only public handle to entries.
#[derive(Default)]
pub struct CachePin {
    entry: Option<Arc<CacheEntry>>,
}

impl CachePin {
    /// A pin holding nothing, e.g. the result of a failed probe.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adopt an entry whose pin count already includes this pin.
    pub(crate) fn from_entry(entry: Arc<CacheEntry>) -> Self {
        Self { entry: Some(entry) }
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_deref()
    }

    /// The pinned entry; panics on an empty pin.
    pub fn checked_entry(&self) -> &CacheEntry {
        self.entry.as_deref().expect("empty CachePin")
    }

    /// Copy `src` into the entry's buffer at `offset`. The pin must be in
    /// exclusive state: this is how a fill writes fetched bytes.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let entry = self.checked_entry();
        assert!(entry.is_exclusive(), "write on a published entry");
        let size = entry.size();
        assert!(
            offset + src.len() <= size,
            "write of {} bytes at {offset} overflows entry of {size}",
            src.len()
        );
        // SAFETY: the pin holds the entry in exclusive state.
        let buffers = unsafe { entry.buffers_mut() };
        if size < TINY_DATA_SIZE {
            buffers.tiny[offset..offset + src.len()].copy_from_slice(src);
            return;
        }
        let mut src_pos = 0;
        let mut run_start = 0;
        for run in buffers.data.runs_mut() {
            let run_len = run.byte_size();
            let write_at = offset + src_pos;
            if write_at < run_start + run_len {
                let in_run = write_at - run_start;
                let n = (run_len - in_run).min(src.len() - src_pos);
                run.as_mut_slice()[in_run..in_run + n].copy_from_slice(&src[src_pos..src_pos + n]);
                src_pos += n;
                if src_pos == src.len() {
                    return;
                }
            }
            run_start += run_len;
        }
        assert_eq!(src_pos, src.len(), "entry runs shorter than entry size");
    }

    /// Gather the entry's content into one contiguous buffer. The pin must
    /// be readable (shared, or exclusive and owned by the caller).
    pub fn copy_to_bytes(&self) -> Bytes {
        let entry = self.checked_entry();
        let size = entry.size();
        let mut out = BytesMut::with_capacity(size);
        // SAFETY: holding this pin keeps the buffers stable.
        let buffers = unsafe { entry.buffers() };
        if size < TINY_DATA_SIZE {
            out.extend_from_slice(&buffers.tiny[..size]);
        } else {
            let mut remaining = size;
            for run in buffers.data.runs() {
                let n = run.byte_size().min(remaining);
                out.extend_from_slice(&run.as_slice()[..n]);
                remaining -= n;
                if remaining == 0 {
                    break;
                }
            }
        }
        out.freeze()
    }
}

impl Clone for CachePin {
    /// Explicit copy of a pin takes another reference. Exclusive pins are
    /// not copyable.
    fn clone(&self) -> Self {
        if let Some(entry) = &self.entry {
            entry.add_reference();
        }
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl Drop for CachePin {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.release();
        }
    }
}

impl std::fmt::Debug for CachePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "CachePin({entry:?})"),
            None => write!(f, "CachePin(empty)"),
        }
    }
}
