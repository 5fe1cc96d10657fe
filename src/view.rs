//! View Pool
//!
//! A fixed population of view slots, preallocated at startup, each able to
//! expose one granularity-aligned window of one stream. Binding fills the
//! slot's buffer from the mapping backend; release makes the slot
//! victim-eligible but nothing is unmapped eagerly. Victim selection is a
//! clock sweep over the slot array from a moving cursor, skipping in-use and
//! recently-touched slots.
//!
//! # Locking
//!
//! One pool mutex guards bindings, active counts and the clock cursor; it is
//! never held across backing I/O. Slot data lives behind a per-slot
//! `Arc<RwLock<Vec<u8>>>` that is stable for the life of the pool, so copies
//! in and out of a view take only that slot's data lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{CacheError, Result};
use crate::types::StreamId;

/// Stable index of a view slot in the pool.
pub type ViewId = usize;

/// What a view slot is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewBinding {
    /// Unowned and reusable.
    Free,
    /// Exposing the window of `stream` starting at `offset`.
    Bound { stream: StreamId, offset: u64 },
}

struct ViewSlot {
    binding: ViewBinding,
    /// Active-use count; the victim policy never reclaims a nonzero slot.
    active: u32,
    /// Clock reference bit, set on reference and cleared by the sweep.
    touched: bool,
    /// Bytes actually present from the backing store at bind time; the
    /// remainder of the buffer is zero.
    valid: usize,
    data: Arc<RwLock<Vec<u8>>>,
}

struct PoolState {
    slots: Vec<ViewSlot>,
    /// Moving victim cursor for the clock sweep.
    cursor: usize,
}

/// Global table of fixed-size views.
pub struct ViewPool {
    granularity: u64,
    state: Mutex<PoolState>,
    binds: AtomicU64,
    victimized: AtomicU64,
    reference_hits: AtomicU64,
}

impl ViewPool {
    pub fn new(view_count: usize, granularity: u64) -> Self {
        let slots = (0..view_count)
            .map(|_| ViewSlot {
                binding: ViewBinding::Free,
                active: 0,
                touched: false,
                valid: 0,
                data: Arc::new(RwLock::new(Vec::new())),
            })
            .collect();
        Self {
            granularity,
            state: Mutex::new(PoolState { slots, cursor: 0 }),
            binds: AtomicU64::new(0),
            victimized: AtomicU64::new(0),
            reference_hits: AtomicU64::new(0),
        }
    }

    /// View window size in bytes.
    #[inline]
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Take another active reference on `id` if it is still bound to the
    /// expected window. Returns `false` when the slot was rebound underneath
    /// a stale index entry.
    pub fn reference(&self, id: ViewId, stream: StreamId, offset: u64) -> bool {
        let mut state = self.state.lock();
        let slot = &mut state.slots[id];
        if slot.binding != (ViewBinding::Bound { stream, offset }) {
            return false;
        }
        slot.active += 1;
        slot.touched = true;
        self.reference_hits.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Reserve a slot for a new binding, victimizing if necessary. Returns
    /// the slot and the binding it displaced (so the owner's view index can
    /// be purged). The caller must follow up with [`install`](Self::install)
    /// or [`abort_bind`](Self::abort_bind); until then the slot is held
    /// active with an empty buffer and must not be published.
    pub fn reserve(&self, stream: StreamId, offset: u64) -> Result<(ViewId, Option<ViewBinding>)> {
        debug_assert_eq!(offset % self.granularity, 0);
        let mut state = self.state.lock();

        // Free slot first.
        if let Some(id) = state
            .slots
            .iter()
            .position(|s| s.binding == ViewBinding::Free)
        {
            let slot = &mut state.slots[id];
            slot.binding = ViewBinding::Bound { stream, offset };
            slot.active = 1;
            slot.touched = true;
            slot.valid = 0;
            return Ok((id, None));
        }

        // Clock sweep: first lap spares recently-touched slots while clearing
        // their reference bits; second lap takes any idle slot.
        let count = state.slots.len();
        let mut victim = None;
        'sweep: for lap in 0..2 {
            for step in 0..count {
                let id = (state.cursor + step) % count;
                let slot = &mut state.slots[id];
                if slot.active > 0 {
                    continue;
                }
                if lap == 0 && slot.touched {
                    slot.touched = false;
                    continue;
                }
                victim = Some(id);
                state.cursor = (id + 1) % count;
                break 'sweep;
            }
        }

        let Some(id) = victim else {
            return Err(CacheError::ResourceExhausted(
                "all views are in active use".into(),
            ));
        };

        let slot = &mut state.slots[id];
        let displaced = slot.binding;
        slot.binding = ViewBinding::Bound { stream, offset };
        slot.active = 1;
        slot.touched = true;
        slot.valid = 0;
        self.victimized.fetch_add(1, Ordering::Relaxed);
        trace!(view = id, ?displaced, %stream, offset, "view victimized and rebound");

        let displaced = match displaced {
            ViewBinding::Free => None,
            bound => Some(bound),
        };
        Ok((id, displaced))
    }

    /// Install backing bytes into a reserved slot. The buffer is padded with
    /// zeros to the full granularity so partial windows at end-of-stream read
    /// as zero.
    pub fn install(&self, id: ViewId, bytes: Vec<u8>) {
        let valid = bytes.len();
        let data = {
            let mut state = self.state.lock();
            let slot = &mut state.slots[id];
            debug_assert!(matches!(slot.binding, ViewBinding::Bound { .. }));
            slot.valid = valid;
            Arc::clone(&slot.data)
        };
        let mut buf = data.write();
        buf.clear();
        buf.extend_from_slice(&bytes);
        buf.resize(self.granularity as usize, 0);
        self.binds.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a reservation whose backing read failed.
    pub fn abort_bind(&self, id: ViewId) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[id];
        debug_assert_eq!(slot.active, 1);
        slot.binding = ViewBinding::Free;
        slot.active = 0;
        slot.touched = false;
        slot.valid = 0;
    }

    /// Drop one active reference. The slot becomes victim-eligible at zero
    /// but keeps its binding and data until the clock sweep needs it.
    pub fn release(&self, id: ViewId) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[id];
        debug_assert!(slot.active > 0, "release of inactive view {id}");
        slot.active = slot.active.saturating_sub(1);
    }

    /// Explicitly unbind a view, at stream teardown or trailing-window
    /// release. Refuses slots still in active use (a racing reader may have
    /// re-referenced the slot); those are left for the clock sweep. Returns
    /// whether the slot was freed.
    pub fn unbind(&self, id: ViewId) -> bool {
        let data = {
            let mut state = self.state.lock();
            let slot = &mut state.slots[id];
            if slot.active > 0 {
                return false;
            }
            slot.binding = ViewBinding::Free;
            slot.touched = false;
            slot.valid = 0;
            Arc::clone(&slot.data)
        };
        data.write().clear();
        true
    }

    /// Handle to the slot's data buffer, valid while the caller holds an
    /// active reference.
    pub fn data(&self, id: ViewId) -> Arc<RwLock<Vec<u8>>> {
        let state = self.state.lock();
        Arc::clone(&state.slots[id].data)
    }

    /// Bytes present from the backing store at bind time.
    pub fn valid_len(&self, id: ViewId) -> usize {
        self.state.lock().slots[id].valid
    }

    /// Current binding of `id`.
    pub fn binding(&self, id: ViewId) -> ViewBinding {
        self.state.lock().slots[id].binding
    }

    /// Current active-use count of `id`.
    pub fn active_count(&self, id: ViewId) -> u32 {
        self.state.lock().slots[id].active
    }

    /// Number of slots currently bound.
    pub fn bound_views(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.binding != ViewBinding::Free)
            .count()
    }

    /// (total binds, victimizations, reference hits) since creation.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.binds.load(Ordering::Relaxed),
            self.victimized.load(Ordering::Relaxed),
            self.reference_hits.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
