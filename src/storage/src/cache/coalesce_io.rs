//! Grouping of pinned-entry reads into fewer physical IOs.
//!
//! Neighboring regions whose byte gap is at most `max_gap` are fetched in one
//! scatter read; gaps are represented as sentinel ranges that carry only a
//! length, so the reader can skip them without a buffer.

use std::ptr::NonNull;

use crate::CacheError;

use super::pin::CachePin;

/// Totals of a coalesced read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceIoStats {
    /// Bytes delivered into entry buffers.
    pub payload_bytes: u64,
    /// Bytes read and thrown away to bridge gaps.
    pub extra_bytes: u64,
    /// Number of physical IOs issued.
    pub num_ios: u64,
}

/// One element of a scatter read: either writable memory or a gap to skip.
pub struct IoRange {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

// SAFETY: the pointer refers to buffers of entries pinned for the duration
// of the read; IoRange itself does no aliasing.
unsafe impl Send for IoRange {}

impl IoRange {
    pub(crate) fn data(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr: Some(ptr),
            len,
        }
    }

    /// A gap of `len` bytes with no backing memory.
    pub fn gap(len: usize) -> Self {
        Self { ptr: None, len }
    }

    pub fn is_gap(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The target memory of a data range, `None` for gaps.
    ///
    /// # Safety
    ///
    /// Only valid while the pins the range was built from are alive and
    /// exclusive, and only one caller may write a given range at a time.
    pub unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        self.ptr
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) })
    }
}

impl std::fmt::Debug for IoRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_gap() {
            write!(f, "IoRange(gap {})", self.len)
        } else {
            write!(f, "IoRange(data {})", self.len)
        }
    }
}

/// Group `num_items` offset-sorted, non-overlapping regions into batched
/// IOs, bounded by `max_gap` bytes between consecutive regions and
/// `ranges_per_io` scatter ranges per IO.
///
/// `item_ranges` appends an item's target ranges; `gap_range` appends a
/// sentinel for skipped bytes; `io` performs one batched read over
/// `[begin, end)` starting at the given file offset.
pub fn coalesce_io<Range>(
    num_items: usize,
    max_gap: u64,
    ranges_per_io: usize,
    offset_of: impl Fn(usize) -> u64,
    size_of: impl Fn(usize) -> usize,
    ranges_of: impl Fn(usize) -> usize,
    mut item_ranges: impl FnMut(usize, &mut Vec<Range>),
    mut gap_range: impl FnMut(u64, &mut Vec<Range>),
    mut io: impl FnMut(usize, usize, u64, &mut [Range]) -> Result<(), CacheError>,
) -> Result<CoalesceIoStats, CacheError> {
    let mut stats = CoalesceIoStats::default();
    let mut begin = 0;
    while begin < num_items {
        let mut end = begin + 1;
        let mut num_ranges = ranges_of(begin);
        let mut batch_end_offset = offset_of(begin) + size_of(begin) as u64;
        while end < num_items {
            let next_offset = offset_of(end);
            debug_assert!(
                next_offset >= batch_end_offset,
                "items must be sorted and non-overlapping"
            );
            let gap = next_offset.saturating_sub(batch_end_offset);
            let added_ranges = ranges_of(end) + usize::from(gap > 0);
            if gap > max_gap || num_ranges + added_ranges > ranges_per_io {
                break;
            }
            num_ranges += added_ranges;
            batch_end_offset = next_offset + size_of(end) as u64;
            end += 1;
        }

        let mut ranges: Vec<Range> = Vec::with_capacity(num_ranges);
        let mut covered_to = offset_of(begin);
        for index in begin..end {
            let offset = offset_of(index);
            if offset > covered_to {
                let gap = offset - covered_to;
                gap_range(gap, &mut ranges);
                stats.extra_bytes += gap;
            }
            item_ranges(index, &mut ranges);
            stats.payload_bytes += size_of(index) as u64;
            covered_to = offset + size_of(index) as u64;
        }
        io(begin, end, offset_of(begin), &mut ranges)?;
        stats.num_ios += 1;
        begin = end;
    }
    Ok(stats)
}

/// Read the regions behind `pins` in as few IOs as the gap and range limits
/// allow. All pins must be exclusive (being filled) and sorted by the offset
/// `offset_of` reports. Each entry's backing pages appear as one range per
/// page run; tiny entries contribute a single range.
pub fn read_pins(
    pins: &[CachePin],
    max_gap: u64,
    ranges_per_io: usize,
    offset_of: impl Fn(usize) -> u64,
    mut read: impl FnMut(&[CachePin], usize, usize, u64, &mut [IoRange]) -> Result<(), CacheError>,
) -> Result<CoalesceIoStats, CacheError> {
    coalesce_io(
        pins.len(),
        max_gap,
        ranges_per_io,
        &offset_of,
        |index| pins[index].checked_entry().size(),
        |index| {
            let entry = pins[index].checked_entry();
            // SAFETY: the pin holds the entry for the duration of the call.
            unsafe { entry.buffers() }.data.num_runs().max(1)
        },
        |index, ranges| {
            let entry = pins[index].checked_entry();
            debug_assert!(entry.is_exclusive(), "read_pins on a published entry");
            let size = entry.size();
            // SAFETY: the pin holds the entry exclusive while we build and
            // use the ranges.
            let buffers = unsafe { entry.buffers_mut() };
            if buffers.data.is_empty() {
                let ptr = NonNull::new(buffers.tiny.as_mut_ptr())
                    .unwrap_or(NonNull::dangling());
                ranges.push(IoRange::data(ptr, size));
                return;
            }
            let mut remaining = size;
            for run in buffers.data.runs_mut() {
                let n = run.byte_size().min(remaining);
                let ptr = NonNull::new(run.as_mut_ptr()).expect("page run is never null");
                ranges.push(IoRange::data(ptr, n));
                remaining -= n;
                if remaining == 0 {
                    break;
                }
            }
            debug_assert_eq!(remaining, 0, "entry runs shorter than entry size");
        },
        |gap, ranges| ranges.push(IoRange::gap(gap as usize)),
        |begin, end, offset, ranges| read(pins, begin, end, offset, ranges),
    )
}
