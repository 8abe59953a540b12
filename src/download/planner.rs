//! Splits a resource of known size into contiguous byte ranges.

use super::constants::MIN_BLOCK_SIZE;

const MIB: u64 = 1024 * 1024;

/// An inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range covers at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Block count actually used for a file of `file_size` bytes.
///
/// With `adaptive` set, small files get fewer blocks than the hint:
/// under 10 MiB at most 2, under 50 MiB at most 4, under 100 MiB at most 6.
#[must_use]
pub fn effective_concurrency(file_size: u64, concurrency_hint: usize, adaptive: bool) -> usize {
    let hint = concurrency_hint.max(1);
    if file_size <= MIN_BLOCK_SIZE {
        return 1;
    }
    if !adaptive {
        return hint;
    }
    let tier_cap = match file_size {
        s if s < 10 * MIB => 2,
        s if s < 50 * MIB => 4,
        s if s < 100 * MIB => 6,
        _ => usize::MAX,
    };
    hint.min(tier_cap)
}

/// Plans disjoint, contiguous ranges covering exactly `file_size` bytes.
///
/// Returns an empty plan for a zero size; the caller then downloads a single
/// unknown-size block. Each range is `⌈file_size / n⌉` bytes except the last,
/// which takes whatever remains.
///
/// ```
/// use rangefetch_core::download::plan;
///
/// let ranges = plan(10_000_000, 4, false);
/// assert_eq!(ranges.len(), 4);
/// assert_eq!((ranges[1].start, ranges[1].end), (2_500_000, 4_999_999));
/// ```
#[must_use]
pub fn plan(file_size: u64, concurrency_hint: usize, adaptive: bool) -> Vec<ByteRange> {
    if file_size == 0 {
        return Vec::new();
    }

    let blocks = effective_concurrency(file_size, concurrency_hint, adaptive);
    let blocks = u64::try_from(blocks).unwrap_or(u64::MAX).min(file_size);
    let block_size = file_size.div_ceil(blocks);
    let last_byte = file_size - 1;

    let mut ranges = Vec::with_capacity(usize::try_from(blocks).unwrap_or(0));
    let mut start = 0u64;
    for index in 0..blocks {
        if start > last_byte {
            break;
        }
        let mut end = if index + 1 == blocks {
            last_byte
        } else {
            start.saturating_add(block_size - 1).min(last_byte)
        };
        // every range keeps at least one byte; the next start follows this end
        if end < start {
            end = start;
        }
        ranges.push(ByteRange { start, end });
        start = end + 1;
    }

    if let Some(last) = ranges.last_mut() {
        last.end = last_byte;
    }
    ranges
}
