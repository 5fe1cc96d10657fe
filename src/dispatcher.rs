//! Background Work Dispatcher
//!
//! A small elastic pool of worker threads draining two FIFO queues. The
//! express queue carries scan ticks and teardown, which must not sit behind a
//! backlog of transfers; the regular queue carries prefetch and write-behind.
//! Workers spawn on demand up to the ceiling and exit after sitting idle past
//! the configured timeout, down to the floor.
//!
//! Workers hold only a weak reference to their handler, so dropping the cache
//! manager wakes and retires the pool instead of leaking it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::stream::OpenInstance;
use crate::types::{ByteRange, StreamId};

/// A unit of background work.
pub enum WorkItem {
    /// Prefetch a range on behalf of one open instance.
    ReadAhead {
        instance: Arc<OpenInstance>,
        range: ByteRange,
    },
    /// Write some of a stream's dirty pages, within the pass budget.
    WriteBehind { stream: StreamId, pages: u64 },
    /// One lazy-write scan pass over the dirty list.
    LazyWriteScan,
    /// Retire a closed stream whose dirty data has drained.
    TeardownStream { stream: StreamId },
}

impl WorkItem {
    fn is_express(&self) -> bool {
        matches!(
            self,
            WorkItem::LazyWriteScan | WorkItem::TeardownStream { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            WorkItem::ReadAhead { .. } => "read_ahead",
            WorkItem::WriteBehind { .. } => "write_behind",
            WorkItem::LazyWriteScan => "lazy_write_scan",
            WorkItem::TeardownStream { .. } => "teardown",
        }
    }
}

/// Executes work items; implemented by the cache core.
pub trait WorkHandler: Send + Sync {
    fn execute(&self, item: WorkItem);
}

struct QueueState {
    express: VecDeque<WorkItem>,
    regular: VecDeque<WorkItem>,
    workers: usize,
    idle: usize,
    shutdown: bool,
}

struct DispatcherInner {
    handler: Weak<dyn WorkHandler>,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    state: Mutex<QueueState>,
    cond: Condvar,
    executed: AtomicU64,
}

/// Elastic worker pool over an express and a regular work queue.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        handler: Weak<dyn WorkHandler>,
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handler,
                min_workers,
                max_workers,
                idle_timeout,
                state: Mutex::new(QueueState {
                    express: VecDeque::new(),
                    regular: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                executed: AtomicU64::new(0),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Queue a work item, spawning a worker if none is idle and the pool is
    /// below its ceiling. Items posted after shutdown are dropped.
    pub fn post(&self, item: WorkItem) {
        let spawn = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            trace!(item = item.name(), "work item queued");
            if item.is_express() {
                state.express.push_back(item);
            } else {
                state.regular.push_back(item);
            }
            let spawn = state.idle == 0 && state.workers < self.inner.max_workers;
            if spawn {
                state.workers += 1;
            }
            spawn
        };
        if spawn {
            self.spawn_worker();
        }
        self.inner.cond.notify_one();
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("cache-worker".into())
            .spawn(move || worker_loop(inner))
            .expect("spawn cache worker");
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Stop accepting work, wake everyone, and join the pool. Queued items
    /// are discarded.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.express.clear();
            state.regular.clear();
        }
        self.inner.cond.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("dispatcher shut down");
    }

    /// Items executed since creation.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// (queued express, queued regular, live workers).
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        let state = self.inner.state.lock();
        (state.express.len(), state.regular.len(), state.workers)
    }
}

fn worker_loop(inner: Arc<DispatcherInner>) {
    loop {
        let item = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    state.workers -= 1;
                    return;
                }
                if let Some(item) = state.express.pop_front() {
                    break item;
                }
                if let Some(item) = state.regular.pop_front() {
                    break item;
                }
                state.idle += 1;
                let timed_out = inner
                    .cond
                    .wait_for(&mut state, inner.idle_timeout)
                    .timed_out();
                state.idle -= 1;
                // Surplus idle workers retire down to the pool floor.
                if timed_out
                    && state.workers > inner.min_workers
                    && state.express.is_empty()
                    && state.regular.is_empty()
                {
                    state.workers -= 1;
                    trace!(remaining = state.workers, "idle worker exiting");
                    return;
                }
            }
        };

        let Some(handler) = inner.handler.upgrade() else {
            // Cache is gone; nothing left to run items against.
            inner.state.lock().workers -= 1;
            return;
        };
        handler.execute(item);
        inner.executed.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Recorder {
        scans: AtomicUsize,
        writes: AtomicUsize,
        order: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scans: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    impl WorkHandler for Recorder {
        fn execute(&self, item: WorkItem) {
            self.order.lock().push(item.name());
            match item {
                WorkItem::LazyWriteScan => {
                    self.scans.fetch_add(1, Ordering::SeqCst);
                }
                WorkItem::WriteBehind { .. } => {
                    self.writes.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_items_are_executed() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::new(
            Arc::downgrade(&recorder) as Weak<dyn WorkHandler>,
            1,
            2,
            Duration::from_millis(50),
        );
        dispatcher.post(WorkItem::LazyWriteScan);
        dispatcher.post(WorkItem::WriteBehind {
            stream: StreamId(1),
            pages: 4,
        });
        assert!(wait_until(1000, || dispatcher.executed() == 2));
        assert_eq!(recorder.scans.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.writes.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn test_express_items_jump_the_regular_backlog() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::new(
            Arc::downgrade(&recorder) as Weak<dyn WorkHandler>,
            0,
            1,
            Duration::from_millis(50),
        );
        // Build the backlog before any worker exists, then post the scan
        // last; with one worker it must still run no later than second.
        {
            let mut state = dispatcher.inner.state.lock();
            state.regular.push_back(WorkItem::WriteBehind {
                stream: StreamId(1),
                pages: 1,
            });
            state.regular.push_back(WorkItem::WriteBehind {
                stream: StreamId(2),
                pages: 1,
            });
        }
        dispatcher.post(WorkItem::LazyWriteScan);
        assert!(wait_until(1000, || dispatcher.executed() == 3));
        assert_eq!(recorder.order.lock()[0], "lazy_write_scan");
        dispatcher.shutdown();
    }

    #[test]
    fn test_post_after_shutdown_is_dropped() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::new(
            Arc::downgrade(&recorder) as Weak<dyn WorkHandler>,
            0,
            1,
            Duration::from_millis(10),
        );
        dispatcher.shutdown();
        dispatcher.post(WorkItem::LazyWriteScan);
        assert_eq!(dispatcher.executed(), 0);
    }

    #[test]
    fn test_pool_shrinks_to_floor_when_idle() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::new(
            Arc::downgrade(&recorder) as Weak<dyn WorkHandler>,
            0,
            2,
            Duration::from_millis(10),
        );
        dispatcher.post(WorkItem::LazyWriteScan);
        assert!(wait_until(1000, || dispatcher.executed() == 1));
        assert!(wait_until(1000, || dispatcher.queue_depths().2 == 0));
        dispatcher.shutdown();
    }

    #[test]
    fn test_dead_handler_retires_workers() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::new(
            Arc::downgrade(&recorder) as Weak<dyn WorkHandler>,
            1,
            1,
            Duration::from_millis(50),
        );
        drop(recorder);
        dispatcher.post(WorkItem::LazyWriteScan);
        assert!(wait_until(1000, || dispatcher.queue_depths().2 == 0));
        assert_eq!(dispatcher.executed(), 0);
        dispatcher.shutdown();
    }
}
