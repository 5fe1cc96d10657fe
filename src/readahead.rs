//! Read-Ahead Prediction
//!
//! Each open instance of a stream carries a small access history: the byte
//! windows of its last two reads. When a new read begins where a remembered
//! window ended (after masking low-order noise bits, so header peeks and
//! slightly ragged offsets do not break the pattern), the access is judged
//! sequential and a prefetch range is proposed. Transfer sizes start at the
//! request size and double per detection up to the configured clamp.
//!
//! The predictor is pure state; the owner drives it under its own lock and
//! posts the proposed range to the worker pool.

use crate::types::{align_up, ByteRange};

/// Tuning captured from [`CacheConfig`](crate::CacheConfig) at open time.
#[derive(Debug, Clone, Copy)]
pub struct ReadAheadTuning {
    /// Proposed ranges are aligned to this granularity.
    pub granularity: u64,
    /// Clamp on a single prefetch transfer, in bytes.
    pub max_transfer: usize,
    /// Low-order offset bits ignored when comparing windows.
    pub noise_mask: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AccessWindow {
    offset: u64,
    beyond: u64,
}

/// Per-open-instance read-ahead state.
#[derive(Debug, Default)]
pub struct ReadAhead {
    /// Two most recent read windows, oldest first. Two are kept because
    /// concurrent readers of one handle interleave, and either may be the
    /// one the next read follows.
    windows: [AccessWindow; 2],
    /// Where the next prefetch should begin; never moves backwards.
    next_offset: u64,
    /// Current transfer size, doubled per detection.
    length: usize,
    /// One prefetch in flight per instance.
    active: bool,
}

impl ReadAhead {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a foreground read and propose a prefetch range if the access
    /// pattern warrants one. `force_sequential` is set for streams whose
    /// opener declared sequential-only intent; those prefetch on every read.
    pub fn record_read(
        &mut self,
        offset: u64,
        len: usize,
        force_sequential: bool,
        tuning: &ReadAheadTuning,
    ) -> Option<ByteRange> {
        if len == 0 {
            return None;
        }
        let beyond = offset + len as u64;
        let mask = !tuning.noise_mask;

        let sequential = force_sequential
            || self
                .windows
                .iter()
                .any(|w| w.beyond > 0 && (offset & mask) == (w.beyond & mask));

        self.windows[0] = self.windows[1];
        self.windows[1] = AccessWindow { offset, beyond };

        if !sequential {
            self.length = 0;
            return None;
        }

        // Double the transfer per detection, from the request size up to the
        // clamp.
        let grown = if self.length == 0 {
            len.saturating_mul(2)
        } else {
            self.length.saturating_mul(2)
        };
        self.length = grown.min(tuning.max_transfer).max(tuning.granularity as usize);

        let start = align_up(beyond, tuning.granularity).max(self.next_offset);
        let len = align_up(self.length as u64, tuning.granularity) as usize;
        self.next_offset = start + len as u64;
        Some(ByteRange::new(start, len))
    }

    /// Claim the single in-flight prefetch slot. Returns `false` when a
    /// prefetch for this instance is already posted or running.
    pub fn try_begin(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    /// Release the in-flight slot once the prefetch worker finishes.
    pub fn complete(&mut self) {
        self.active = false;
    }

    /// Farthest byte any read through this instance has reached. Drives
    /// trailing-view release for sequential-only streams.
    pub fn high_water(&self) -> u64 {
        self.windows[1].beyond.max(self.windows[0].beyond)
    }
}

// =============================================================================
// Tests
// =============================================================================
