//! Dirty-Memory Throttling
//!
//! The accountant keeps the system-wide dirty page count and the FIFO of
//! writers waiting for it to drop. Writers ask for admission before dirtying;
//! past the threshold they are queued in arrival order and woken strictly
//! FIFO as the lazy writer retires pages, so no late arrival overtakes an
//! earlier one. The counters here also feed the lazy-write scan's per-pass
//! budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::StreamId;

/// Notification invoked with the ticket's two context words once the
/// deferred write is admitted.
pub type AdmitFn = Box<dyn FnOnce(u64, u64) + Send>;

/// Ticket handed to a deferred writer; signaled when its pages fit under the
/// threshold.
#[derive(Clone)]
pub struct WriteGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_all();
    }

    /// Block until signaled or `timeout` elapses. Returns whether admission
    /// was granted.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.inner.signaled.lock();
        if *signaled {
            return true;
        }
        self.inner.cond.wait_for(&mut signaled, timeout);
        *signaled
    }

    /// Non-blocking check.
    pub fn is_open(&self) -> bool {
        *self.inner.signaled.lock()
    }
}

/// How a queued writer learns of its admission: a gate it blocks on, or a
/// callback fired with its two opaque context words.
enum Waiter {
    Gate(WriteGate),
    Callback { on_admit: AdmitFn, context: (u64, u64) },
}

struct DeferredWrite {
    stream: StreamId,
    pages: u64,
    waiter: Waiter,
}

/// System-wide dirty accounting and write admission.
pub struct Throttle {
    threshold: u64,
    target: u64,
    total_dirty: AtomicU64,
    /// Pages dirtied by foreground writers since the last scan took its
    /// budget; measures the production rate the lazy writer races against.
    dirtied_since_scan: AtomicU64,
    deferred_writes: AtomicU64,
    queue: Mutex<VecDeque<DeferredWrite>>,
}

impl Throttle {
    pub fn new(threshold: u64, target: u64) -> Self {
        debug_assert!(target <= threshold);
        Self {
            threshold,
            target,
            total_dirty: AtomicU64::new(0),
            dirtied_since_scan: AtomicU64::new(0),
            deferred_writes: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Pages currently dirty across all streams.
    pub fn total_dirty(&self) -> u64 {
        self.total_dirty.load(Ordering::Relaxed)
    }

    /// Dirty pages the lazy writer drives toward.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Account pages that just went dirty.
    pub fn charge(&self, pages: u64) {
        self.total_dirty.fetch_add(pages, Ordering::Relaxed);
        self.dirtied_since_scan.fetch_add(pages, Ordering::Relaxed);
    }

    /// Account pages that went clean. The caller follows up with
    /// [`release_deferred`](Self::release_deferred) once its locks are dropped.
    pub fn credit(&self, pages: u64) {
        let prev = self.total_dirty.fetch_sub(pages, Ordering::Relaxed);
        debug_assert!(prev >= pages, "dirty page count underflow");
    }

    /// Foreground dirty rate since the last call, for the scan budget.
    pub fn take_dirtied_since_scan(&self) -> u64 {
        self.dirtied_since_scan.swap(0, Ordering::Relaxed)
    }

    /// Times a writer has been queued behind the threshold.
    pub fn deferred_writes(&self) -> u64 {
        self.deferred_writes.load(Ordering::Relaxed)
    }

    /// Would dirtying `pages` now stay under the threshold? Honors queue
    /// order: while earlier writers wait, later arrivals are refused even if
    /// their pages would fit. A per-stream threshold override tightens the
    /// check further for that stream.
    pub fn can_write(&self, pages: u64, stream_dirty_and_limit: Option<(u64, u64)>) -> bool {
        if let Some((stream_dirty, limit)) = stream_dirty_and_limit {
            if stream_dirty + pages > limit {
                return false;
            }
        }
        if self.total_dirty() + pages > self.threshold {
            return false;
        }
        self.queue.lock().is_empty()
    }

    /// Queue a writer behind the threshold. `retrying` re-queues at the front
    /// so an already-admitted-once writer is not pushed behind newcomers.
    pub fn defer(&self, stream: StreamId, pages: u64, retrying: bool) -> WriteGate {
        let gate = WriteGate::new();
        let entry = DeferredWrite {
            stream,
            pages,
            waiter: Waiter::Gate(gate.clone()),
        };
        let mut queue = self.queue.lock();
        if retrying {
            queue.push_front(entry);
        } else {
            queue.push_back(entry);
        }
        self.deferred_writes.fetch_add(1, Ordering::Relaxed);
        debug!(%stream, pages, depth = queue.len(), "write deferred behind dirty threshold");
        gate
    }

    /// Queue a writer that does not want to block. `on_admit` runs with the
    /// two context words when the ticket reaches the front and fits.
    pub fn defer_callback(&self, stream: StreamId, pages: u64, on_admit: AdmitFn, context: (u64, u64)) {
        let entry = DeferredWrite {
            stream,
            pages,
            waiter: Waiter::Callback { on_admit, context },
        };
        let mut queue = self.queue.lock();
        queue.push_back(entry);
        self.deferred_writes.fetch_add(1, Ordering::Relaxed);
        debug!(%stream, pages, depth = queue.len(), "callback write deferred behind dirty threshold");
    }

    /// Wake queued writers whose pages now fit, in strict FIFO order. Stops
    /// at the first entry that still does not fit. Gates are signaled and
    /// callbacks invoked after the queue lock is dropped.
    pub fn release_deferred(&self) {
        let admitted: Vec<DeferredWrite> = {
            let mut queue = self.queue.lock();
            let mut admitted = Vec::new();
            while let Some(front) = queue.front() {
                if self.total_dirty() + front.pages > self.threshold {
                    break;
                }
                if let Some(entry) = queue.pop_front() {
                    admitted.push(entry);
                }
            }
            admitted
        };
        for entry in admitted {
            debug!(stream = %entry.stream, pages = entry.pages, "deferred write admitted");
            match entry.waiter {
                Waiter::Gate(gate) => gate.signal(),
                Waiter::Callback { on_admit, context } => on_admit(context.0, context.1),
            }
        }
    }

    /// Depth of the deferred queue.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
