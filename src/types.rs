//! Core Value Types
//!
//! Small identifier and token types shared across the cache, plus page and
//! view-window arithmetic helpers.

/// Identifier of a cached file stream.
///
/// Assigned by the embedder (typically derived from its own file table); the
/// cache never interprets the value beyond equality and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Log ordering token (log sequence number).
///
/// Monotonically meaningful marker used to sequence write-back against log
/// durability: a dirty buffer is never written out before the log is durable
/// up to its newest observed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero token, ordered before every real token.
    pub const ZERO: Lsn = Lsn(0);
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Inclusive-start, exclusive-end byte range within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte of the range.
    pub offset: u64,
    /// Length in bytes.
    pub len: usize,
}

impl ByteRange {
    /// Create a range; zero-length ranges are permitted for probes.
    pub fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte.
    #[inline]
    pub fn beyond(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// True when the two ranges share at least one byte.
    #[inline]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.offset < other.beyond() && other.offset < self.beyond()
    }
}

/// Round `offset` down to a multiple of `granularity` (power of two).
#[inline]
pub fn align_down(offset: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());
    offset & !(granularity - 1)
}

/// Round `offset` up to a multiple of `granularity` (power of two).
#[inline]
pub fn align_up(offset: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());
    (offset + granularity - 1) & !(granularity - 1)
}

/// Number of whole pages spanned by the byte range `[offset, offset + len)`.
#[inline]
pub fn pages_spanned(offset: u64, len: usize, page_size: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    let page = page_size as u64;
    let first = offset / page;
    let last = (offset + len as u64 - 1) / page;
    last - first + 1
}

/// Index of the view window covering `offset`.
#[inline]
pub fn window_index(offset: u64, granularity: u64) -> usize {
    (offset / granularity) as usize
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_down(0, 4096), 0);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
    }

    #[test]
    fn test_pages_spanned() {
        assert_eq!(pages_spanned(0, 0, 4096), 0);
        assert_eq!(pages_spanned(0, 1, 4096), 1);
        assert_eq!(pages_spanned(0, 4096, 4096), 1);
        assert_eq!(pages_spanned(0, 4097, 4096), 2);
        // Unaligned start crossing a page boundary.
        assert_eq!(pages_spanned(4000, 200, 4096), 2);
    }

    #[test]
    fn test_range_overlap() {
        let a = ByteRange::new(0, 4096);
        let b = ByteRange::new(4096, 4096);
        let c = ByteRange::new(2048, 4096);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_window_index() {
        let gran = 256 * 1024;
        assert_eq!(window_index(0, gran), 0);
        assert_eq!(window_index(gran - 1, gran), 0);
        assert_eq!(window_index(gran, gran), 1);
    }
}
