//! Per-Stream Cache State
//!
//! A [`Stream`] is the shared cache state for one file stream: its section
//! size, the table mapping view windows to pool slots, its pinned-buffer
//! registry, the dirty-page bitmap, and teardown bookkeeping. It is created
//! on the first open and torn down lazily after the last close once its
//! dirty data is retired.
//!
//! An [`OpenInstance`] is one opener's private state: the read-ahead history
//! and the sequential-intent flag, separate so concurrent openers of the same
//! stream do not pollute each other's access patterns.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::backend::StreamCallbacks;
use crate::buffer::{BcbList, MaskBuffer};
use crate::readahead::ReadAhead;
use crate::types::StreamId;
use crate::view::ViewId;

bitflags! {
    /// Caching-mode flags declared at open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        /// Opener will pin ranges; the buffer registry is exercised.
        const PIN_ACCESS = 1 << 0;
        /// Dirty data is written only on explicit flush, never by the lazy
        /// writer. Used for streams whose writes are ordered externally.
        const MODIFIED_NO_WRITE = 1 << 1;
        /// Stream is short-lived scratch data; write-behind deprioritizes it
        /// in the hope the data dies before reaching the backing store.
        const TEMPORARY = 1 << 2;
    }
}

/// A view slot bound into this stream's window table.
#[derive(Debug, Clone, Copy)]
pub struct WindowView {
    pub view: ViewId,
    /// Extra active reference held while the window has dirty data, so the
    /// victim policy cannot reclaim the slot out from under the flush path.
    pub dirty_hold: bool,
}

pub(crate) struct StreamState {
    pub section_size: u64,
    /// Bytes valid on the backing store. Promoted toward the goal once a
    /// flush retires everything dirty.
    pub valid_data_length: u64,
    /// One past the highest byte ever written through the cache. Reads past
    /// this return zeros without consulting the backing store.
    pub valid_data_goal: u64,
    /// Written to since the last scan pass looked at it; idle streams yield
    /// write-behind slots to busy ones.
    pub write_active: bool,
    pub open_count: u32,
    /// Window index to bound view.
    pub windows: HashMap<usize, WindowView>,
    /// Most recently used window, a fast path around the table probe.
    pub active_window: Option<(usize, ViewId)>,
    /// Dirty pages charged to this stream (bitmap plus pinned buffers).
    pub pages_dirty: u64,
    /// Optional per-stream dirty clamp, tighter than the global threshold.
    pub dirty_page_limit: Option<u64>,
    /// Consecutive scan passes in which the budget ran out before this
    /// stream was serviced.
    pub skipped_passes: u32,
    /// Consecutive write-behind failures, for backoff logging.
    pub write_failures: u32,
    /// Last close has happened; the stream dies once its dirty data drains.
    pub teardown: bool,
}

/// Shared cache state for one stream.
pub struct Stream {
    id: StreamId,
    flags: StreamFlags,
    callbacks: Arc<dyn StreamCallbacks>,
    /// Serializes view binding for this stream so only one thread faults a
    /// given window in from the backing store. Held across backend reads;
    /// never taken while holding `state`.
    pub(crate) bind_lock: Mutex<()>,
    /// Serializes buffer lookup/creation against buffer destruction, so a
    /// pin never lands on a buffer being unregistered.
    pub(crate) pin_lock: Mutex<()>,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) bcbs: BcbList,
    pub(crate) mask: Mutex<MaskBuffer>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        section_size: u64,
        valid_data_length: u64,
        flags: StreamFlags,
        callbacks: Arc<dyn StreamCallbacks>,
        bcb_shard_span: u64,
        bcb_list_threshold: u64,
    ) -> Self {
        let bcbs = BcbList::new(bcb_shard_span);
        if section_size > bcb_list_threshold {
            bcbs.ensure_span(section_size);
        }
        let valid = valid_data_length.min(section_size);
        Self {
            id,
            flags,
            callbacks,
            bind_lock: Mutex::new(()),
            pin_lock: Mutex::new(()),
            state: Mutex::new(StreamState {
                section_size,
                valid_data_length: valid,
                valid_data_goal: valid,
                write_active: false,
                open_count: 0,
                windows: HashMap::new(),
                active_window: None,
                pages_dirty: 0,
                dirty_page_limit: None,
                skipped_passes: 0,
                write_failures: 0,
                teardown: false,
            }),
            bcbs,
            mask: Mutex::new(MaskBuffer::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    #[inline]
    pub(crate) fn callbacks(&self) -> &Arc<dyn StreamCallbacks> {
        &self.callbacks
    }

    /// Register one more opener. Reopening a stream that was waiting to die
    /// cancels the pending teardown.
    pub(crate) fn open(&self) -> u32 {
        let mut state = self.state.lock();
        state.teardown = false;
        state.open_count += 1;
        state.open_count
    }

    /// Drop one opener. Returns the remaining count; at zero the caller
    /// begins lazy teardown.
    pub(crate) fn close(&self) -> u32 {
        let mut state = self.state.lock();
        debug_assert!(state.open_count > 0, "close of unopened stream");
        state.open_count -= 1;
        if state.open_count == 0 {
            state.teardown = true;
        }
        state.open_count
    }

    pub fn section_size(&self) -> u64 {
        self.state.lock().section_size
    }

    /// Grow the section. Shrinking is not supported; truncation goes through
    /// teardown and re-open in this design.
    pub(crate) fn extend_section(&self, new_size: u64, bcb_list_threshold: u64) {
        let mut state = self.state.lock();
        if new_size > state.section_size {
            state.section_size = new_size;
            if new_size > bcb_list_threshold {
                drop(state);
                self.bcbs.ensure_span(new_size);
            }
        }
    }

    pub fn valid_data_length(&self) -> u64 {
        self.state.lock().valid_data_length
    }

    /// One past the highest byte written through the cache.
    pub fn valid_data_goal(&self) -> u64 {
        self.state.lock().valid_data_goal
    }

    /// Advance the write goal after a write lands beyond it.
    pub(crate) fn advance_valid_data(&self, beyond: u64) {
        let mut state = self.state.lock();
        if beyond > state.valid_data_goal {
            state.valid_data_goal = beyond;
        }
    }

    /// Promote the valid-data mark to the goal once nothing dirty remains,
    /// after a flush or a write-behind pass drained the stream.
    pub(crate) fn promote_valid_data(&self) {
        let mut state = self.state.lock();
        if state.pages_dirty == 0 && state.valid_data_goal > state.valid_data_length {
            state.valid_data_length = state.valid_data_goal;
        }
    }

    /// Dirty pages currently charged to this stream.
    pub fn pages_dirty(&self) -> u64 {
        self.state.lock().pages_dirty
    }

    pub fn set_dirty_page_limit(&self, limit: Option<u64>) {
        self.state.lock().dirty_page_limit = limit;
    }

    pub fn dirty_page_limit(&self) -> Option<u64> {
        self.state.lock().dirty_page_limit
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.state.lock().teardown
    }

    /// Number of pinned buffers registered.
    pub fn pinned_buffers(&self) -> usize {
        self.bcbs.len()
    }
}

/// One opener's private view of a stream.
pub struct OpenInstance {
    pub(crate) stream: Arc<Stream>,
    pub(crate) read_ahead: Mutex<ReadAhead>,
    /// Opener declared strictly sequential access; prefetch fires on every
    /// read and trailing views are released eagerly.
    pub(crate) sequential: bool,
}

impl OpenInstance {
    pub(crate) fn new(stream: Arc<Stream>, sequential: bool) -> Self {
        Self {
            stream,
            read_ahead: Mutex::new(ReadAhead::new()),
            sequential,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }
}

// =============================================================================
// Tests
// =============================================================================
