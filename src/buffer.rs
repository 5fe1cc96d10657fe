//! Pinned Buffers
//!
//! A [`Buffer`] represents a byte range of a stream held in memory by one or
//! more active requests and/or dirty data. Pinning readers and all writers
//! take shared access (byte-level coordination is strictly up to the caller);
//! a flusher takes exclusive access so the bytes cannot change while they are
//! written out. A buffer is created on the first pin of its range and
//! destroyed when the pin count reaches zero and it is not dirty.
//!
//! [`MaskBuffer`] is the cheap alternative for bulk small writes: a per-stream
//! bitmap of dirty pages with first/last/resume markers, avoiding one buffer
//! allocation per write.
//!
//! [`PinnedRange`] is the handle returned to callers; a pin spanning several
//! pre-existing, non-contiguous buffers yields an overlap handle that wraps
//! the members and owns none of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{CacheError, Result};
use crate::types::{ByteRange, Lsn, StreamId};
use crate::view::ViewId;

/// How to unpin a [`PinnedRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpinAction {
    /// Drop the pin; dirty data stays dirty.
    Unpin,
    /// Drop the pin and clear the dirty state (the caller wrote the data out
    /// through some other path).
    SetClean,
}

#[derive(Debug)]
struct BufferState {
    pin_count: u32,
    /// Set while a flusher holds exclusive access.
    flushing: bool,
    dirty: bool,
    oldest_lsn: Lsn,
    newest_lsn: Lsn,
    view: Option<ViewId>,
}

/// A pinned region within a stream's byte range.
#[derive(Debug)]
pub struct Buffer {
    range: ByteRange,
    state: Mutex<BufferState>,
    gate: Condvar,
}

impl Buffer {
    pub fn new(range: ByteRange, view: ViewId) -> Self {
        Self {
            range,
            state: Mutex::new(BufferState {
                pin_count: 0,
                flushing: false,
                dirty: false,
                oldest_lsn: Lsn::ZERO,
                newest_lsn: Lsn::ZERO,
                view: Some(view),
            }),
            gate: Condvar::new(),
        }
    }

    /// Byte range covered by this buffer.
    #[inline]
    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// One past the last byte, used for descending-offset searches.
    #[inline]
    pub fn beyond(&self) -> u64 {
        self.range.beyond()
    }

    /// Take a shared pin. With `wait` false this fails immediately instead of
    /// waiting out an in-progress flush.
    pub fn pin_shared(&self, wait: bool) -> Result<()> {
        let mut state = self.state.lock();
        while state.flushing {
            if !wait {
                return Err(CacheError::WouldBlock);
            }
            self.gate.wait(&mut state);
        }
        state.pin_count += 1;
        Ok(())
    }

    /// Drop one pin. Returns `(remaining pins, dirty)` so the owning list can
    /// decide whether the buffer is now destroyable.
    pub fn unpin(&self) -> (u32, bool) {
        let mut state = self.state.lock();
        assert!(state.pin_count > 0, "unpin of unpinned buffer");
        state.pin_count -= 1;
        if state.pin_count == 0 {
            self.gate.notify_all();
        }
        (state.pin_count, state.dirty)
    }

    /// Take exclusive access for write-out. With `wait` false, any pinner or
    /// concurrent flusher means an immediate would-block; the lazy writer
    /// treats that as a collision and backs off.
    pub fn begin_flush(&self, wait: bool) -> Result<()> {
        let mut state = self.state.lock();
        while state.flushing || state.pin_count > 0 {
            if !wait {
                return Err(CacheError::WouldBlock);
            }
            self.gate.wait(&mut state);
        }
        state.flushing = true;
        Ok(())
    }

    /// Release exclusive access, optionally clearing the dirty flag.
    pub fn end_flush(&self, clean: bool) {
        let mut state = self.state.lock();
        debug_assert!(state.flushing);
        state.flushing = false;
        if clean {
            state.dirty = false;
            state.oldest_lsn = Lsn::ZERO;
            state.newest_lsn = Lsn::ZERO;
        }
        self.gate.notify_all();
    }

    /// Mark dirty, folding the ordering tokens. Returns `true` on the
    /// clean→dirty transition. The newest token never goes backwards.
    pub fn mark_dirty(&self, lsn: Option<(Lsn, Lsn)>) -> bool {
        let mut state = self.state.lock();
        let first = !state.dirty;
        state.dirty = true;
        if let Some((oldest, newest)) = lsn {
            if first || state.oldest_lsn == Lsn::ZERO {
                state.oldest_lsn = oldest;
            } else {
                state.oldest_lsn = state.oldest_lsn.min(oldest);
            }
            state.newest_lsn = state.newest_lsn.max(newest);
        }
        first
    }

    /// Clear the dirty flag outside a flush (SetClean unpin). Returns whether
    /// it was dirty.
    pub fn set_clean(&self) -> bool {
        let mut state = self.state.lock();
        let was = state.dirty;
        state.dirty = false;
        state.oldest_lsn = Lsn::ZERO;
        state.newest_lsn = Lsn::ZERO;
        was
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn pin_count(&self) -> u32 {
        self.state.lock().pin_count
    }

    pub fn newest_lsn(&self) -> Lsn {
        self.state.lock().newest_lsn
    }

    pub fn oldest_lsn(&self) -> Lsn {
        self.state.lock().oldest_lsn
    }

    /// View currently backing this buffer.
    pub fn view(&self) -> Option<ViewId> {
        self.state.lock().view
    }

    /// Detach the backing view at destruction; returns it for release.
    pub fn take_view(&self) -> Option<ViewId> {
        self.state.lock().view.take()
    }

    /// True when the buffer holds nothing worth keeping.
    pub fn is_destroyable(&self) -> bool {
        let state = self.state.lock();
        state.pin_count == 0 && !state.dirty && !state.flushing
    }
}

// =============================================================================
// Mask buffer (bitmap dirty tracking)
// =============================================================================

const BITS_PER_WORD: u64 = 64;

/// Bitmap of dirty pages for one stream, with markers guiding the lazy
/// writer's resume position.
#[derive(Debug, Default)]
pub struct MaskBuffer {
    bitmap: Vec<u64>,
    dirty_pages: u64,
    first_dirty_page: u64,
    last_dirty_page: u64,
    resume_write_page: u64,
}

impl MaskBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn word_bit(page: u64) -> (usize, u64) {
        ((page / BITS_PER_WORD) as usize, 1 << (page % BITS_PER_WORD))
    }

    fn ensure_capacity(&mut self, page: u64) {
        let words = (page / BITS_PER_WORD) as usize + 1;
        if self.bitmap.len() < words {
            self.bitmap.resize(words, 0);
        }
    }

    /// Set the bits for `[first_page, last_page]`. Returns how many were
    /// newly set; already-dirty pages are never double-counted.
    pub fn mark_range(&mut self, first_page: u64, last_page: u64) -> u64 {
        debug_assert!(first_page <= last_page);
        self.ensure_capacity(last_page);
        let mut newly = 0;
        for page in first_page..=last_page {
            let (word, bit) = Self::word_bit(page);
            if self.bitmap[word] & bit == 0 {
                self.bitmap[word] |= bit;
                newly += 1;
            }
        }
        if newly > 0 {
            if self.dirty_pages == 0 {
                self.first_dirty_page = first_page;
                self.last_dirty_page = last_page;
                self.resume_write_page = first_page;
            } else {
                self.first_dirty_page = self.first_dirty_page.min(first_page);
                self.last_dirty_page = self.last_dirty_page.max(last_page);
            }
            self.dirty_pages += newly;
        }
        newly
    }

    /// Clear the bits for `[first_page, last_page]`, returning how many were
    /// actually set.
    pub fn clear_range(&mut self, first_page: u64, last_page: u64) -> u64 {
        let mut cleared = 0;
        for page in first_page..=last_page {
            let (word, bit) = Self::word_bit(page);
            if word < self.bitmap.len() && self.bitmap[word] & bit != 0 {
                self.bitmap[word] &= !bit;
                cleared += 1;
            }
        }
        self.dirty_pages -= cleared;
        if self.dirty_pages == 0 {
            self.first_dirty_page = 0;
            self.last_dirty_page = 0;
            self.resume_write_page = 0;
        }
        cleared
    }

    /// Is a particular page dirty?
    pub fn is_set(&self, page: u64) -> bool {
        let (word, bit) = Self::word_bit(page);
        word < self.bitmap.len() && self.bitmap[word] & bit != 0
    }

    /// Find the next run of consecutive dirty pages at or after
    /// `resume_write_page`, wrapping to the first dirty page if none remain
    /// past the marker. At most `max_pages` long, and never crossing a
    /// `window_pages` boundary, so one run always maps to one view. The
    /// resume marker advances exactly past the returned run; the tail of a
    /// run cut at a boundary is picked up by the next call.
    pub fn next_dirty_run(&mut self, max_pages: u64, window_pages: u64) -> Option<(u64, u64)> {
        debug_assert!(window_pages > 0);
        if self.dirty_pages == 0 || max_pages == 0 {
            return None;
        }
        let start = self
            .find_set_from(self.resume_write_page)
            .or_else(|| self.find_set_from(self.first_dirty_page))?;
        let window_last = (start / window_pages + 1) * window_pages - 1;
        let cap = max_pages.min(window_last - start + 1);
        let mut len = 1;
        while len < cap && self.is_set(start + len) {
            len += 1;
        }
        self.resume_write_page = start + len;
        Some((start, len))
    }

    fn find_set_from(&self, from: u64) -> Option<u64> {
        let mut page = from;
        while page <= self.last_dirty_page {
            if self.is_set(page) {
                return Some(page);
            }
            page += 1;
        }
        None
    }

    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_pages == 0
    }

    pub fn first_dirty_page(&self) -> u64 {
        self.first_dirty_page
    }

    pub fn last_dirty_page(&self) -> u64 {
        self.last_dirty_page
    }
}

// =============================================================================
// Sharded buffer list
// =============================================================================

/// Offset-ordered registry of a stream's pinned buffers.
///
/// One map below the sharding threshold; a fixed array of span-aligned maps
/// above it, bounding list-walk cost for large streams. Iteration for flush
/// is by descending offset, matching the order misses take in sequential I/O.
pub struct BcbList {
    shard_span: u64,
    shards: RwLock<Vec<Mutex<BTreeMap<u64, Arc<Buffer>>>>>,
}

impl BcbList {
    /// A single-shard list; [`ensure_span`](Self::ensure_span) grows it when
    /// the stream crosses the sharding threshold.
    pub fn new(shard_span: u64) -> Self {
        Self {
            shard_span,
            shards: RwLock::new(vec![Mutex::new(BTreeMap::new())]),
        }
    }

    /// Grow the shard array so offsets below `section_size` hash to
    /// span-sized shards. Existing buffers are redistributed. No-op when
    /// already large enough.
    pub fn ensure_span(&self, section_size: u64) {
        let wanted = ((section_size + self.shard_span - 1) / self.shard_span).max(1) as usize;
        let mut shards = self.shards.write();
        if shards.len() >= wanted {
            return;
        }
        let mut all: Vec<(u64, Arc<Buffer>)> = Vec::new();
        for shard in shards.iter() {
            all.extend(shard.lock().iter().map(|(k, v)| (*k, Arc::clone(v))));
        }
        let mut next: Vec<Mutex<BTreeMap<u64, Arc<Buffer>>>> =
            (0..wanted).map(|_| Mutex::new(BTreeMap::new())).collect();
        for (offset, buffer) in all {
            let idx = ((offset / self.shard_span) as usize).min(wanted - 1);
            next[idx].get_mut().insert(offset, buffer);
        }
        *shards = next;
    }

    fn shard_index(&self, offset: u64, shard_count: usize) -> usize {
        ((offset / self.shard_span) as usize).min(shard_count - 1)
    }

    /// Insert a buffer keyed by its start offset.
    pub fn insert(&self, buffer: Arc<Buffer>) {
        let shards = self.shards.read();
        let idx = self.shard_index(buffer.range().offset, shards.len());
        shards[idx].lock().insert(buffer.range().offset, buffer);
    }

    /// Remove the buffer starting at `offset`, if present.
    pub fn remove(&self, offset: u64) -> Option<Arc<Buffer>> {
        let shards = self.shards.read();
        let idx = self.shard_index(offset, shards.len());
        let removed = shards[idx].lock().remove(&offset);
        removed
    }

    /// All buffers overlapping `[offset, offset + len)`, ascending by offset.
    /// A buffer can overlap from a lower shard, so the search starts one
    /// shard early.
    pub fn find_overlapping(&self, range: ByteRange) -> Vec<Arc<Buffer>> {
        let shards = self.shards.read();
        let first = self.shard_index(range.offset, shards.len()).saturating_sub(1);
        let last = self.shard_index(range.beyond().saturating_sub(1).max(range.offset), shards.len());
        let mut found = Vec::new();
        for shard in shards.iter().take(last + 1).skip(first) {
            for (_, buffer) in shard.lock().iter() {
                if buffer.range().overlaps(&range) {
                    found.push(Arc::clone(buffer));
                }
            }
        }
        found.sort_by_key(|b| b.range().offset);
        found
    }

    /// Snapshot of every buffer, descending by offset.
    pub fn snapshot_descending(&self) -> Vec<Arc<Buffer>> {
        let shards = self.shards.read();
        let mut all: Vec<Arc<Buffer>> = Vec::new();
        for shard in shards.iter() {
            all.extend(shard.lock().values().cloned());
        }
        all.sort_by(|a, b| b.range().offset.cmp(&a.range().offset));
        all
    }

    /// Total buffers registered.
    pub fn len(&self) -> usize {
        let shards = self.shards.read();
        shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Pin handles
// =============================================================================

/// Handle onto a pinned byte range of one stream.
///
/// Either a single buffer or an overlap wrapper over several pre-existing
/// buffers. Dropping the handle without `unpin` leaks the pin by design; the
/// manager's unpin is the only release path, mirroring the explicit
/// pin/unpin discipline of the callers this layer serves.
#[derive(Debug)]
pub struct PinnedRange {
    pub(crate) stream: StreamId,
    pub(crate) range: ByteRange,
    pub(crate) members: Vec<Arc<Buffer>>,
}

impl PinnedRange {
    pub(crate) fn new(stream: StreamId, range: ByteRange, members: Vec<Arc<Buffer>>) -> Self {
        debug_assert!(!members.is_empty());
        Self {
            stream,
            range,
            members,
        }
    }

    /// Stream this pin belongs to.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// The pinned byte range as requested (page aligned internally).
    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// True when the pin spans multiple underlying buffers.
    pub fn is_overlap(&self) -> bool {
        self.members.len() > 1
    }

    pub(crate) fn newest_lsn(&self) -> Lsn {
        self.members
            .iter()
            .map(|b| b.newest_lsn())
            .max()
            .unwrap_or(Lsn::ZERO)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(offset: u64, len: usize) -> Arc<Buffer> {
        Arc::new(Buffer::new(ByteRange::new(offset, len), 0))
    }

    #[test]
    fn test_pin_unpin_balance() {
        let b = buf(0, 4096);
        b.pin_shared(true).expect("pin");
        b.pin_shared(true).expect("pin");
        assert_eq!(b.pin_count(), 2);
        assert_eq!(b.unpin(), (1, false));
        assert_eq!(b.unpin(), (0, false));
        assert!(b.is_destroyable());
    }

    #[test]
    #[should_panic(expected = "unpin of unpinned buffer")]
    fn test_unbalanced_unpin_panics() {
        let b = buf(0, 4096);
        b.unpin();
    }

    #[test]
    fn test_flush_excludes_pins() {
        let b = buf(0, 4096);
        b.pin_shared(true).expect("pin");
        // A pinned buffer cannot be flushed without waiting.
        assert!(matches!(b.begin_flush(false), Err(CacheError::WouldBlock)));
        b.unpin();
        b.begin_flush(false).expect("flush");
        // And a flushing buffer rejects non-waiting pins.
        assert!(matches!(b.pin_shared(false), Err(CacheError::WouldBlock)));
        b.end_flush(true);
        b.pin_shared(false).expect("pin after flush");
    }

    #[test]
    fn test_mark_dirty_folds_lsns() {
        let b = buf(0, 4096);
        assert!(b.mark_dirty(Some((Lsn(10), Lsn(12)))));
        assert!(!b.mark_dirty(Some((Lsn(8), Lsn(20)))));
        assert_eq!(b.oldest_lsn(), Lsn(8));
        assert_eq!(b.newest_lsn(), Lsn(20));
        // Newest never regresses.
        b.mark_dirty(Some((Lsn(15), Lsn(16))));
        assert_eq!(b.newest_lsn(), Lsn(20));
    }

    #[test]
    fn test_flush_clean_resets_lsns() {
        let b = buf(0, 4096);
        b.mark_dirty(Some((Lsn(5), Lsn(9))));
        b.begin_flush(true).expect("flush");
        b.end_flush(true);
        assert!(!b.is_dirty());
        assert_eq!(b.newest_lsn(), Lsn::ZERO);
    }

    #[test]
    fn test_mask_buffer_counts_once() {
        let mut mask = MaskBuffer::new();
        assert_eq!(mask.mark_range(3, 5), 3);
        assert_eq!(mask.mark_range(4, 6), 1);
        assert_eq!(mask.dirty_pages(), 4);
        assert_eq!(mask.first_dirty_page(), 3);
        assert_eq!(mask.last_dirty_page(), 6);
    }

    #[test]
    fn test_mask_buffer_runs_and_resume() {
        let mut mask = MaskBuffer::new();
        mask.mark_range(0, 2);
        mask.mark_range(10, 11);
        assert_eq!(mask.next_dirty_run(64, 64), Some((0, 3)));
        assert_eq!(mask.next_dirty_run(64, 64), Some((10, 2)));
        // Nothing past the marker: wraps to the front after clears.
        mask.clear_range(0, 11);
        assert!(mask.next_dirty_run(64, 64).is_none());
        assert!(mask.is_empty());
    }

    #[test]
    fn test_mask_buffer_run_capped() {
        let mut mask = MaskBuffer::new();
        mask.mark_range(0, 9);
        assert_eq!(mask.next_dirty_run(4, 64), Some((0, 4)));
        assert_eq!(mask.next_dirty_run(4, 64), Some((4, 4)));
        assert_eq!(mask.next_dirty_run(4, 64), Some((8, 2)));
    }

    #[test]
    fn test_mask_buffer_run_stops_at_window_boundary() {
        let mut mask = MaskBuffer::new();
        mask.mark_range(2, 6);
        // Run crosses the 4-page window at page 4: first call stops at the
        // boundary, the very next call returns the tail without wrapping.
        assert_eq!(mask.next_dirty_run(64, 4), Some((2, 2)));
        mask.clear_range(2, 3);
        assert_eq!(mask.next_dirty_run(64, 4), Some((4, 3)));
        mask.clear_range(4, 6);
        assert!(mask.next_dirty_run(64, 4).is_none());
        assert!(mask.is_empty());
    }

    #[test]
    fn test_bcb_list_overlap_search() {
        let list = BcbList::new(512 * 1024);
        list.insert(buf(0, 4096));
        list.insert(buf(8192, 4096));
        list.insert(buf(65536, 4096));

        let hits = list.find_overlapping(ByteRange::new(0, 12288));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].range().offset, 0);
        assert_eq!(hits[1].range().offset, 8192);
    }

    #[test]
    fn test_bcb_list_descending_snapshot() {
        let list = BcbList::new(512 * 1024);
        list.insert(buf(4096, 4096));
        list.insert(buf(0, 4096));
        list.insert(buf(8192, 4096));
        let all = list.snapshot_descending();
        let offsets: Vec<u64> = all.iter().map(|b| b.range().offset).collect();
        assert_eq!(offsets, vec![8192, 4096, 0]);
    }

    #[test]
    fn test_bcb_list_resharding_preserves_buffers() {
        let list = BcbList::new(512 * 1024);
        list.insert(buf(0, 4096));
        list.insert(buf(3 * 1024 * 1024, 4096));
        list.ensure_span(8 * 1024 * 1024);
        assert_eq!(list.len(), 2);
        assert!(list.remove(3 * 1024 * 1024).is_some());
        assert_eq!(list.len(), 1);
    }
}
