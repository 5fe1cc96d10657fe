//! Cache Manager Core
//!
//! Ties the pieces together: the view pool, per-stream state, the dirty
//! accountant, the worker pool and the scan clock. All public entry points
//! live on [`CacheManager`] and the per-open [`CacheHandle`].
//!
//! # Locking
//!
//! Lock order, outermost first: stream `bind_lock` / `pin_lock`, the streams
//! map, a stream's `mask`, the global dirty list, a stream's `state`, the
//! view pool. Dirty-bitmap bits and the window dirty-hold flag change only
//! under the mask lock, and the dirty-list membership of a stream changes
//! only together with its dirty count, so the "on the list iff dirty" and
//! "held iff dirty" invariants hold at every release point. No fine-grained
//! lock is ever held across backing I/O; view binding is serialized by the
//! per-stream bind lock instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::collections::VecDeque;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::backend::{LogHandle, MappingBackend, StreamCallbacks};
use crate::buffer::{Buffer, PinnedRange, UnpinAction};
use crate::config::CacheConfig;
use crate::dispatcher::{Dispatcher, WorkHandler, WorkItem};
use crate::error::{CacheError, Result};
use crate::readahead::ReadAheadTuning;
use crate::scheduler::{ScanTarget, Scheduler};
use crate::stream::{OpenInstance, Stream, StreamFlags, WindowView};
use crate::throttle::{AdmitFn, Throttle};
use crate::types::{align_down, align_up, pages_spanned, window_index, ByteRange, Lsn, StreamId};
use crate::view::{ViewBinding, ViewId, ViewPool};

/// Caching mode requested when opening a stream.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub flags: StreamFlags,
    /// Strictly sequential access: prefetch on every read and release
    /// trailing views eagerly.
    pub sequential: bool,
    /// Per-stream dirty clamp, tighter than the global threshold.
    pub dirty_page_limit: Option<u64>,
    /// Bytes of the stream valid on the backing store, when shorter than
    /// the stream itself; reads past it return zeros. Honored on the open
    /// that creates the cache state; defaults to the full stream length.
    pub valid_data_length: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            flags: StreamFlags::empty(),
            sequential: false,
            dirty_page_limit: None,
            valid_data_length: None,
        }
    }
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub read_aheads: u64,
    pub view_binds: u64,
    pub view_victimizations: u64,
    pub view_reference_hits: u64,
    pub scan_passes: u64,
    pub pages_written: u64,
    pub write_collisions: u64,
    pub deferred_writes: u64,
    pub dirty_pages: u64,
    pub cached_streams: usize,
    pub teardowns: u64,
}

pub(crate) struct CacheShared {
    config: CacheConfig,
    backend: Arc<dyn MappingBackend>,
    log: Arc<dyn LogHandle>,
    views: ViewPool,
    throttle: Throttle,
    streams: DashMap<StreamId, Arc<Stream>>,
    /// Streams with dirty pages, in service order. Membership changes only
    /// together with the stream's dirty count.
    dirty_list: Mutex<VecDeque<StreamId>>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    scan_armed: AtomicBool,
    shutting_down: AtomicBool,

    read_hits: AtomicU64,
    read_misses: AtomicU64,
    read_aheads: AtomicU64,
    scan_passes: AtomicU64,
    pages_written: AtomicU64,
    write_collisions: AtomicU64,
    teardowns: AtomicU64,
}

/// The cache manager. One per backing store; owns the view pool and the
/// background machinery, both retired on drop.
pub struct CacheManager {
    shared: Arc<CacheShared>,
}

impl CacheManager {
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn MappingBackend>,
        log: Arc<dyn LogHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak: &Weak<CacheShared>| {
            let handler: Weak<dyn WorkHandler> = weak.clone();
            let target: Weak<dyn ScanTarget> = weak.clone();
            CacheShared {
                views: ViewPool::new(config.view_count, config.view_granularity),
                throttle: Throttle::new(config.dirty_page_threshold, config.dirty_page_target),
                streams: DashMap::new(),
                dirty_list: Mutex::new(VecDeque::new()),
                dispatcher: Dispatcher::new(
                    handler,
                    config.min_worker_threads,
                    config.max_worker_threads,
                    config.worker_idle_timeout,
                ),
                scheduler: Scheduler::spawn(target),
                scan_armed: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                read_hits: AtomicU64::new(0),
                read_misses: AtomicU64::new(0),
                read_aheads: AtomicU64::new(0),
                scan_passes: AtomicU64::new(0),
                pages_written: AtomicU64::new(0),
                write_collisions: AtomicU64::new(0),
                teardowns: AtomicU64::new(0),
                backend,
                log,
                config,
            }
        });
        info!(
            views = shared.config.view_count,
            granularity = shared.config.view_granularity,
            threshold = shared.config.dirty_page_threshold,
            "cache manager started"
        );
        Ok(Self { shared })
    }

    /// Start caching a stream (or join its existing cache state) and return
    /// a handle for this opener.
    pub fn open(
        &self,
        id: StreamId,
        options: OpenOptions,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<CacheHandle> {
        let instance = self.shared.open(id, options, callbacks)?;
        Ok(CacheHandle {
            shared: Arc::clone(&self.shared),
            instance,
        })
    }

    /// Synchronously flush every cached stream.
    pub fn flush_all(&self) -> Result<()> {
        let ids: Vec<StreamId> = self.shared.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            let stream = self.shared.streams.get(&id).map(|e| Arc::clone(&e));
            if let Some(stream) = stream {
                self.shared.flush(&stream, None)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats()
    }

    /// Dirty pages currently charged against the global threshold.
    pub fn dirty_pages(&self) -> u64 {
        self.shared.throttle.total_dirty()
    }

    /// Kick off a lazy-write scan pass without waiting for the armed timer.
    pub fn request_scan(&self) {
        self.shared.scan_due();
    }

    /// Admit queued deferred writers whose pages now fit, front to back.
    /// This happens automatically as pages retire; the explicit form is for
    /// embedders that free dirty budget through paths the cache cannot see.
    pub fn post_deferred_writes(&self) {
        self.shared.throttle.release_deferred();
    }

    /// Disarm the scan timer. The next dirty charge re-arms it.
    pub fn cancel_scan(&self) {
        self.shared.scan_armed.store(false, Ordering::SeqCst);
        self.shared.scheduler.cancel();
    }

    /// Flush everything and stop the background machinery. Called by drop;
    /// explicit calls let the embedder observe flush errors first via
    /// [`flush_all`](Self::flush_all).
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// One opener's handle onto a cached stream. Dropping the handle closes it;
/// the stream's cache state is torn down lazily after the last close once
/// its dirty data drains.
pub struct CacheHandle {
    shared: Arc<CacheShared>,
    instance: Arc<OpenInstance>,
}

impl CacheHandle {
    pub fn stream_id(&self) -> StreamId {
        self.instance.stream_id()
    }

    /// Copy `len` bytes at `offset` out of the cache, faulting views in as
    /// needed. Bytes past the stream's valid-data goal read as zeros without
    /// touching the backing store. May schedule a prefetch behind the
    /// reader's back.
    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.shared.read(&self.instance, offset, len, true)
    }

    /// Like [`read`](Self::read) but fails with [`CacheError::WouldBlock`]
    /// rather than faulting a non-resident window in from the backing store.
    pub fn try_read(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.shared.read(&self.instance, offset, len, false)
    }

    /// Copy bytes into the cache and mark them dirty, blocking while the
    /// dirty-page threshold holds the writer back.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.shared.write(&self.instance, offset, data, true)
    }

    /// Like [`write`](Self::write) but fails with
    /// [`CacheError::WouldBlock`] instead of waiting for admission.
    pub fn try_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.shared.write(&self.instance, offset, data, false)
    }

    /// Ask for write admission without blocking. Returns `true` when the
    /// write may proceed now; otherwise a ticket is queued behind earlier
    /// writers and `on_admit` runs with the two context words once the
    /// pages fit.
    pub fn request_admission(
        &self,
        bytes: usize,
        on_admit: AdmitFn,
        context: (u64, u64),
    ) -> bool {
        self.shared
            .request_admission(&self.instance.stream, bytes, on_admit, context)
    }

    /// Pin a byte range in memory. With `wait` false, an in-progress flush
    /// anywhere in the range fails the pin instead of waiting it out.
    pub fn pin(&self, offset: u64, len: usize, wait: bool) -> Result<PinnedRange> {
        self.shared.pin(&self.instance, offset, len, wait)
    }

    /// Copy the pinned bytes out.
    pub fn read_pinned(&self, pin: &PinnedRange) -> Result<Bytes> {
        self.shared.read_pinned(&self.instance, pin)
    }

    /// Overwrite bytes inside the pinned range. The modification is not
    /// dirty until [`mark_dirty`](Self::mark_dirty) says so.
    pub fn write_pinned(&self, pin: &PinnedRange, rel_offset: u64, data: &[u8]) -> Result<()> {
        self.shared.write_pinned(&self.instance, pin, rel_offset, data)
    }

    /// Mark the pinned range dirty, optionally folding in the log tokens
    /// covering the modification.
    pub fn mark_dirty(&self, pin: &PinnedRange, lsn: Option<(Lsn, Lsn)>) {
        self.shared.mark_pin_dirty(&self.instance.stream, pin, lsn);
    }

    /// Mark a cached byte range dirty through the bitmap path, without a pin
    /// and without copying. For data modified in place through a view whose
    /// pin has since been released.
    pub fn mark_dirty_range(&self, offset: u64, len: usize) -> Result<()> {
        self.shared.mark_dirty_range(&self.instance.stream, offset, len)
    }

    /// Release a pin.
    pub fn unpin(&self, pin: PinnedRange, action: UnpinAction) {
        self.shared.unpin(&self.instance.stream, pin, action);
    }

    /// Synchronously write back the stream's dirty data, all of it or one
    /// range. Must not be called with pins held inside the range.
    pub fn flush(&self, range: Option<ByteRange>) -> Result<()> {
        self.shared.flush(&self.instance.stream, range)
    }

    /// Tighten (or clear) this stream's dirty-page clamp.
    pub fn set_dirty_page_limit(&self, limit: Option<u64>) {
        self.instance.stream.set_dirty_page_limit(limit);
    }

    /// Dirty pages currently charged to this stream.
    pub fn dirty_pages(&self) -> u64 {
        self.instance.stream.pages_dirty()
    }

    /// Bytes of this stream known valid on the backing store. Trails the
    /// write goal until a flush drains the dirty data and promotes it.
    pub fn valid_data_length(&self) -> u64 {
        self.instance.stream.valid_data_length()
    }

    /// Close this handle. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.shared.close(&self.instance);
    }
}

// =============================================================================
// Foreground paths
// =============================================================================

impl CacheShared {
    fn open(
        &self,
        id: StreamId,
        options: OpenOptions,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<Arc<OpenInstance>> {
        let section = self.backend.stream_len(id)?;
        // The opener count is bumped under the map shard lock so a racing
        // teardown's remove-if cannot interleave between lookup and open.
        let (stream, openers) = match self.streams.entry(id) {
            Entry::Occupied(entry) => {
                let stream = Arc::clone(entry.get());
                let openers = stream.open();
                (stream, openers)
            }
            Entry::Vacant(entry) => {
                let stream = Arc::new(Stream::new(
                    id,
                    section,
                    options.valid_data_length.unwrap_or(section),
                    options.flags,
                    callbacks,
                    self.config.bcb_shard_span,
                    self.config.bcb_list_threshold,
                ));
                let openers = stream.open();
                entry.insert(Arc::clone(&stream));
                (stream, openers)
            }
        };
        stream.extend_section(section, self.config.bcb_list_threshold);
        if options.dirty_page_limit.is_some() {
            stream.set_dirty_page_limit(options.dirty_page_limit);
        }
        debug!(%id, openers, sequential = options.sequential, "stream opened");
        Ok(Arc::new(OpenInstance::new(stream, options.sequential)))
    }

    fn close(&self, instance: &OpenInstance) {
        let stream = &instance.stream;
        let remaining = stream.close();
        if remaining > 0 {
            return;
        }
        debug!(id = %stream.id(), dirty = stream.pages_dirty(), "last close, teardown pending");
        if stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) && stream.pages_dirty() > 0 {
            // The lazy writer never touches these; the close is the last
            // chance to get the data out.
            if let Err(err) = self.flush(stream, None) {
                warn!(id = %stream.id(), %err, "flush on close failed");
            }
        }
        if stream.pages_dirty() > 0 {
            self.arm_scan(self.config.idle_delay);
        }
        self.maybe_teardown(stream);
    }

    fn read(&self, instance: &Arc<OpenInstance>, offset: u64, len: usize, wait: bool) -> Result<Bytes> {
        let stream = &instance.stream;
        let section = stream.section_size();
        if offset + len as u64 > section {
            return Err(CacheError::InvalidRange {
                stream: stream.id(),
                offset,
                len,
                section_size: section,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        // Bytes past the valid-data goal were never written; they read as
        // zeros and the backing store is not consulted for them.
        let goal = stream.valid_data_goal();
        let cached = if offset >= goal {
            0
        } else {
            ((goal - offset) as usize).min(len)
        };
        let mut out = vec![0_u8; len];
        let all_hit = if cached > 0 {
            self.copy_out(stream, offset, &mut out[..cached], wait)?
        } else {
            true
        };
        if all_hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_misses.fetch_add(1, Ordering::Relaxed);
        }

        let tuning = ReadAheadTuning {
            granularity: self.config.read_ahead_granularity,
            max_transfer: self.config.max_read_ahead,
            noise_mask: self.config.noise_mask,
        };
        let proposal = {
            let mut ra = instance.read_ahead.lock();
            match ra.record_read(offset, len, instance.sequential, &tuning) {
                Some(range) if range.offset < section && ra.try_begin() => Some(range),
                _ => None,
            }
        };
        if let Some(range) = proposal {
            self.dispatcher.post(WorkItem::ReadAhead {
                instance: Arc::clone(instance),
                range,
            });
        }

        if instance.sequential {
            let high = instance.read_ahead.lock().high_water();
            let keep_from = high.saturating_sub(self.config.sequential_map_limit);
            self.release_trailing_windows(stream, keep_from);
        }
        Ok(Bytes::from(out))
    }

    fn write(
        &self,
        instance: &Arc<OpenInstance>,
        offset: u64,
        data: &[u8],
        wait: bool,
    ) -> Result<()> {
        let stream = &instance.stream;
        if data.is_empty() {
            return Ok(());
        }
        let pages = pages_spanned(offset, data.len(), self.config.page_size);
        if !stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) {
            self.admit_write(stream, pages, wait)?;
        }
        let beyond = offset + data.len() as u64;
        if beyond > stream.section_size() {
            stream.extend_section(beyond, self.config.bcb_list_threshold);
        }
        let goal = stream.valid_data_goal();
        if offset > goal {
            // A write landing past the goal leaves a never-written gap
            // behind it; zero it in cache so reads and the flush see zeros,
            // not stale backing bytes.
            self.zero_range(stream, goal, offset)?;
        }
        self.copy_in_and_dirty(stream, offset, data)?;
        stream.advance_valid_data(beyond);
        Ok(())
    }

    /// Hold the writer at the dirty threshold. Deferred writers wait in FIFO
    /// order on a gate the lazy writer opens as pages retire.
    fn admit_write(&self, stream: &Arc<Stream>, pages: u64, wait: bool) -> Result<()> {
        let limit = |s: &Arc<Stream>| s.dirty_page_limit().map(|l| (s.pages_dirty(), l));
        if self.throttle.can_write(pages, limit(stream)) {
            return Ok(());
        }
        if !wait {
            return Err(CacheError::WouldBlock);
        }
        let mut retrying = false;
        loop {
            let gate = self.throttle.defer(stream.id(), pages, retrying);
            // Make sure a scan is coming to drain pages for us.
            self.arm_scan(self.config.first_delay);
            while !gate.wait(self.config.idle_delay) {
                if self.shutting_down.load(Ordering::Acquire) {
                    return Err(CacheError::WouldBlock);
                }
                self.throttle.release_deferred();
            }
            if self.throttle.can_write(pages, limit(stream)) {
                return Ok(());
            }
            retrying = true;
        }
    }

    /// Non-blocking admission with callback notification. `true` means
    /// write now; otherwise a ticket sits behind earlier writers and
    /// `on_admit` fires with the context words once the pages fit.
    fn request_admission(
        &self,
        stream: &Arc<Stream>,
        bytes: usize,
        on_admit: AdmitFn,
        context: (u64, u64),
    ) -> bool {
        if stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) {
            return true;
        }
        let pages = pages_spanned(0, bytes, self.config.page_size);
        let limit = stream.dirty_page_limit().map(|l| (stream.pages_dirty(), l));
        if self.throttle.can_write(pages, limit) {
            return true;
        }
        self.throttle.defer_callback(stream.id(), pages, on_admit, context);
        self.arm_scan(self.config.first_delay);
        false
    }

    /// Bind (or re-reference) the view for one window. The returned id
    /// carries an active reference the caller must release; the bool reports
    /// whether the window was already resident. With `wait` false a window
    /// that would have to be faulted in fails with `WouldBlock` instead.
    fn view_for_window(&self, stream: &Arc<Stream>, window: usize, wait: bool) -> Result<(ViewId, bool)> {
        let win_offset = window as u64 * self.config.view_granularity;
        let id = stream.id();

        {
            let mut state = stream.state.lock();
            if let Some((w, v)) = state.active_window {
                if w == window && self.views.reference(v, id, win_offset) {
                    return Ok((v, true));
                }
            }
            if let Some(wv) = state.windows.get(&window).copied() {
                if self.views.reference(wv.view, id, win_offset) {
                    state.active_window = Some((window, wv.view));
                    return Ok((wv.view, true));
                }
                // Stale entry left behind by a victimized slot.
                state.windows.remove(&window);
            }
        }

        if !wait {
            return Err(CacheError::WouldBlock);
        }
        let _bind = stream.bind_lock.lock();
        // Another thread may have bound the window while we waited.
        {
            let mut state = stream.state.lock();
            if let Some(wv) = state.windows.get(&window).copied() {
                if self.views.reference(wv.view, id, win_offset) {
                    state.active_window = Some((window, wv.view));
                    return Ok((wv.view, true));
                }
                state.windows.remove(&window);
            }
        }

        let (vid, displaced) = self.views.reserve(id, win_offset)?;
        if let Some(ViewBinding::Bound {
            stream: other,
            offset,
        }) = displaced
        {
            self.purge_window_entry(other, offset);
        }
        let bytes = match self
            .backend
            .map_range(id, win_offset, self.config.view_granularity as usize)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                self.views.abort_bind(vid);
                return Err(err);
            }
        };
        self.views.install(vid, bytes);
        let mut state = stream.state.lock();
        state.windows.insert(
            window,
            WindowView {
                view: vid,
                dirty_hold: false,
            },
        );
        state.active_window = Some((window, vid));
        trace!(%id, window, view = vid, "window bound");
        Ok((vid, false))
    }

    /// Drop the window-table entry a victimized slot was serving.
    fn purge_window_entry(&self, id: StreamId, offset: u64) {
        if let Some(stream) = self.streams.get(&id) {
            let window = window_index(offset, self.config.view_granularity);
            let mut state = stream.state.lock();
            if let Some(wv) = state.windows.get(&window).copied() {
                // Dirty holds keep slots active; a victimized slot is clean.
                debug_assert!(!wv.dirty_hold);
                state.windows.remove(&window);
            }
            if matches!(state.active_window, Some((w, _)) if w == window) {
                state.active_window = None;
            }
        }
    }

    /// Window-walk copy out of the cache. Returns whether every window was
    /// already resident.
    fn copy_out(&self, stream: &Arc<Stream>, offset: u64, out: &mut [u8], wait: bool) -> Result<bool> {
        let gran = self.config.view_granularity;
        let mut all_hit = true;
        let mut cur = offset;
        let end = offset + out.len() as u64;
        while cur < end {
            let window = window_index(cur, gran);
            let win_off = window as u64 * gran;
            let (vid, hit) = self.view_for_window(stream, window, wait)?;
            all_hit &= hit;
            let within = (cur - win_off) as usize;
            let take = ((end - cur) as usize).min(gran as usize - within);
            {
                let handle = self.views.data(vid);
                let data = handle.read();
                let dst = (cur - offset) as usize;
                out[dst..dst + take].copy_from_slice(&data[within..within + take]);
            }
            self.views.release(vid);
            cur += take as u64;
        }
        Ok(all_hit)
    }

    /// Window-walk copy into the cache without dirtying; the pin path marks
    /// dirtiness explicitly and its buffers keep the windows resident.
    fn copy_in(&self, stream: &Arc<Stream>, offset: u64, data: &[u8]) -> Result<()> {
        let gran = self.config.view_granularity;
        let mut cur = offset;
        let end = offset + data.len() as u64;
        while cur < end {
            let window = window_index(cur, gran);
            let win_off = window as u64 * gran;
            let (vid, _) = self.view_for_window(stream, window, true)?;
            let within = (cur - win_off) as usize;
            let take = ((end - cur) as usize).min(gran as usize - within);
            {
                let handle = self.views.data(vid);
                let mut buf = handle.write();
                let src = (cur - offset) as usize;
                buf[within..within + take].copy_from_slice(&data[src..src + take]);
            }
            self.views.release(vid);
            cur += take as u64;
        }
        Ok(())
    }

    /// Copy-in for the plain write path: each window chunk is marked dirty
    /// and its view put under dirty hold before our reference is released,
    /// so a victimization can never slip between the copy and the marking.
    fn copy_in_and_dirty(&self, stream: &Arc<Stream>, offset: u64, data: &[u8]) -> Result<()> {
        let gran = self.config.view_granularity;
        let page = self.config.page_size as u64;
        let mut cur = offset;
        let end = offset + data.len() as u64;
        while cur < end {
            let window = window_index(cur, gran);
            let win_off = window as u64 * gran;
            let (vid, _) = self.view_for_window(stream, window, true)?;
            let within = (cur - win_off) as usize;
            let take = ((end - cur) as usize).min(gran as usize - within);
            {
                let handle = self.views.data(vid);
                let mut buf = handle.write();
                let src = (cur - offset) as usize;
                buf[within..within + take].copy_from_slice(&data[src..src + take]);
            }
            self.mark_chunk_dirty(
                stream,
                vid,
                window,
                win_off,
                cur / page,
                (cur + take as u64 - 1) / page,
            );
            self.views.release(vid);
            cur += take as u64;
        }
        Ok(())
    }

    /// Zero the cached bytes of `[from, to)` and mark them dirty, for the
    /// never-written gap a write past the valid-data goal leaves behind.
    fn zero_range(&self, stream: &Arc<Stream>, from: u64, to: u64) -> Result<()> {
        let gran = self.config.view_granularity;
        let page = self.config.page_size as u64;
        let mut cur = from;
        while cur < to {
            let window = window_index(cur, gran);
            let win_off = window as u64 * gran;
            let (vid, _) = self.view_for_window(stream, window, true)?;
            let within = (cur - win_off) as usize;
            let take = ((to - cur) as usize).min(gran as usize - within);
            {
                let handle = self.views.data(vid);
                let mut buf = handle.write();
                buf[within..within + take].fill(0);
            }
            self.mark_chunk_dirty(
                stream,
                vid,
                window,
                win_off,
                cur / page,
                (cur + take as u64 - 1) / page,
            );
            self.views.release(vid);
            cur += take as u64;
        }
        Ok(())
    }

    /// Bitmap-path dirty marking without a copy: binds each window in the
    /// range so the hold can be taken, then marks the pages.
    fn mark_dirty_range(&self, stream: &Arc<Stream>, offset: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let section = stream.section_size();
        if offset + len as u64 > section {
            return Err(CacheError::InvalidRange {
                stream: stream.id(),
                offset,
                len,
                section_size: section,
            });
        }
        let gran = self.config.view_granularity;
        let page = self.config.page_size as u64;
        let mut cur = offset;
        let end = offset + len as u64;
        while cur < end {
            let window = window_index(cur, gran);
            let win_off = window as u64 * gran;
            let (vid, _) = self.view_for_window(stream, window, true)?;
            let within = (cur - win_off) as usize;
            let take = ((end - cur) as usize).min(gran as usize - within);
            self.mark_chunk_dirty(
                stream,
                vid,
                window,
                win_off,
                cur / page,
                (cur + take as u64 - 1) / page,
            );
            self.views.release(vid);
            cur += take as u64;
        }
        Ok(())
    }

    /// Mark `[first_page, last_page]` in the mask and put the window under
    /// dirty hold. The caller holds an active reference on `vid`, so the
    /// binding cannot move while the hold is taken.
    fn mark_chunk_dirty(
        &self,
        stream: &Arc<Stream>,
        vid: ViewId,
        window: usize,
        win_off: u64,
        first_page: u64,
        last_page: u64,
    ) {
        let mut mask = stream.mask.lock();
        let newly = mask.mark_range(first_page, last_page);
        if newly > 0 {
            self.charge_stream(stream, newly);
        }
        let hold_needed = {
            let mut state = stream.state.lock();
            match state.windows.get_mut(&window) {
                Some(wv) if !wv.dirty_hold => {
                    wv.dirty_hold = true;
                    true
                }
                _ => false,
            }
        };
        if hold_needed {
            let held = self.views.reference(vid, stream.id(), win_off);
            debug_assert!(held, "window rebound while actively referenced");
        }
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    fn pin(
        &self,
        instance: &Arc<OpenInstance>,
        offset: u64,
        len: usize,
        wait: bool,
    ) -> Result<PinnedRange> {
        let stream = &instance.stream;
        let section = stream.section_size();
        if len == 0 || offset + len as u64 > section {
            return Err(CacheError::InvalidRange {
                stream: stream.id(),
                offset,
                len,
                section_size: section,
            });
        }
        debug_assert!(
            stream.flags().contains(StreamFlags::PIN_ACCESS),
            "pin on a stream opened without pin access"
        );
        let page = self.config.page_size as u64;
        let aligned = align_down(offset, page);
        let beyond = align_up(offset + len as u64, page);
        let range = ByteRange::new(aligned, (beyond - aligned) as usize);

        loop {
            let blocked = {
                let _guard = stream.pin_lock.lock();
                let members = match self.assemble_members(stream, range) {
                    Ok(members) => members,
                    Err(err) => return Err(err),
                };
                let mut pinned: Vec<Arc<Buffer>> = Vec::with_capacity(members.len());
                let mut blocked = None;
                for member in &members {
                    match member.pin_shared(false) {
                        Ok(()) => pinned.push(Arc::clone(member)),
                        Err(CacheError::WouldBlock) => {
                            blocked = Some(Arc::clone(member));
                            break;
                        }
                        Err(err) => {
                            for p in &pinned {
                                p.unpin();
                            }
                            return Err(err);
                        }
                    }
                }
                match blocked {
                    None => return Ok(PinnedRange::new(stream.id(), range, pinned)),
                    Some(buffer) => {
                        for p in &pinned {
                            p.unpin();
                        }
                        self.sweep_destroyable(stream);
                        buffer
                    }
                }
            };
            if !wait {
                return Err(CacheError::WouldBlock);
            }
            // Wait out the flush holding us up, then retry the whole lookup;
            // the buffer may have been destroyed meanwhile.
            blocked.pin_shared(true)?;
            blocked.unpin();
        }
    }

    /// Existing buffers overlapping `range` plus fresh ones for the gaps,
    /// ascending, together covering the range. New buffers are capped at
    /// window boundaries and hold a view reference for their lifetime.
    /// Caller holds the pin lock.
    fn assemble_members(
        &self,
        stream: &Arc<Stream>,
        range: ByteRange,
    ) -> Result<Vec<Arc<Buffer>>> {
        let existing = stream.bcbs.find_overlapping(range);
        let mut members = Vec::new();
        let mut cursor = range.offset;
        let result = (|| -> Result<()> {
            for buffer in &existing {
                if buffer.range().offset > cursor {
                    self.fill_gap(stream, cursor, buffer.range().offset, &mut members)?;
                }
                members.push(Arc::clone(buffer));
                cursor = cursor.max(buffer.beyond());
            }
            if cursor < range.beyond() {
                self.fill_gap(stream, cursor, range.beyond(), &mut members)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(members),
            Err(err) => {
                self.sweep_destroyable(stream);
                Err(err)
            }
        }
    }

    fn fill_gap(
        &self,
        stream: &Arc<Stream>,
        from: u64,
        to: u64,
        members: &mut Vec<Arc<Buffer>>,
    ) -> Result<()> {
        let gran = self.config.view_granularity;
        let mut cur = from;
        while cur < to {
            let window = window_index(cur, gran);
            let end = to.min(align_down(cur, gran) + gran);
            // The buffer takes over the view reference we get here.
            let (vid, _) = self.view_for_window(stream, window, true)?;
            let buffer = Arc::new(Buffer::new(
                ByteRange::new(cur, (end - cur) as usize),
                vid,
            ));
            stream.bcbs.insert(Arc::clone(&buffer));
            members.push(buffer);
            cur = end;
        }
        Ok(())
    }

    /// Unregister clean, unpinned buffers. Caller holds the pin lock.
    fn sweep_destroyable(&self, stream: &Arc<Stream>) {
        for buffer in stream.bcbs.snapshot_descending() {
            if buffer.is_destroyable() && stream.bcbs.remove(buffer.range().offset).is_some() {
                if let Some(vid) = buffer.take_view() {
                    self.views.release(vid);
                }
            }
        }
    }

    fn read_pinned(&self, instance: &Arc<OpenInstance>, pin: &PinnedRange) -> Result<Bytes> {
        let stream = &instance.stream;
        debug_assert_eq!(pin.stream(), stream.id());
        let range = pin.range();
        let mut out = vec![0_u8; range.len];
        self.copy_out(stream, range.offset, &mut out, true)?;
        Ok(Bytes::from(out))
    }

    fn write_pinned(
        &self,
        instance: &Arc<OpenInstance>,
        pin: &PinnedRange,
        rel_offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let stream = &instance.stream;
        debug_assert_eq!(pin.stream(), stream.id());
        let range = pin.range();
        if rel_offset + data.len() as u64 > range.len as u64 {
            return Err(CacheError::InvalidRange {
                stream: stream.id(),
                offset: range.offset + rel_offset,
                len: data.len(),
                section_size: range.beyond(),
            });
        }
        self.copy_in(stream, range.offset + rel_offset, data)?;
        stream.advance_valid_data(range.offset + rel_offset + data.len() as u64);
        Ok(())
    }

    fn mark_pin_dirty(&self, stream: &Arc<Stream>, pin: &PinnedRange, lsn: Option<(Lsn, Lsn)>) {
        for member in &pin.members {
            if member.mark_dirty(lsn) {
                let r = member.range();
                self.charge_stream(stream, pages_spanned(r.offset, r.len, self.config.page_size));
            }
        }
    }

    fn unpin(&self, stream: &Arc<Stream>, pin: PinnedRange, action: UnpinAction) {
        for member in &pin.members {
            if action == UnpinAction::SetClean && member.set_clean() {
                let r = member.range();
                self.credit_stream(stream, pages_spanned(r.offset, r.len, self.config.page_size));
            }
            let (remaining, dirty) = member.unpin();
            if remaining == 0 && !dirty {
                self.destroy_buffer(stream, member);
            }
        }
        self.maybe_teardown(stream);
    }

    fn destroy_buffer(&self, stream: &Arc<Stream>, buffer: &Arc<Buffer>) {
        let _guard = stream.pin_lock.lock();
        if !buffer.is_destroyable() {
            return;
        }
        if let Some(registered) = stream.bcbs.remove(buffer.range().offset) {
            if Arc::ptr_eq(&registered, buffer) {
                if let Some(vid) = buffer.take_view() {
                    self.views.release(vid);
                }
            } else {
                // A different buffer reused the offset; put it back.
                stream.bcbs.insert(registered);
            }
        }
    }

    // =========================================================================
    // Dirty accounting
    // =========================================================================

    /// Charge freshly dirtied pages. Dirty-list membership moves together
    /// with the count; streams whose writes are externally ordered never hit
    /// the global throttle.
    fn charge_stream(&self, stream: &Arc<Stream>, pages: u64) {
        if pages == 0 {
            return;
        }
        {
            let mut list = self.dirty_list.lock();
            let mut state = stream.state.lock();
            if state.pages_dirty == 0 && !list.contains(&stream.id()) {
                list.push_back(stream.id());
            }
            state.pages_dirty += pages;
            state.write_active = true;
        }
        if !stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) {
            self.throttle.charge(pages);
            self.arm_scan(self.config.first_delay);
        }
    }

    fn credit_stream(&self, stream: &Arc<Stream>, pages: u64) {
        if pages == 0 {
            return;
        }
        {
            let mut list = self.dirty_list.lock();
            let mut state = stream.state.lock();
            debug_assert!(state.pages_dirty >= pages, "dirty credit exceeds charge");
            state.pages_dirty = state.pages_dirty.saturating_sub(pages);
            if state.pages_dirty == 0 {
                let id = stream.id();
                list.retain(|s| *s != id);
            }
        }
        if !stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) {
            self.throttle.credit(pages);
            self.throttle.release_deferred();
        }
    }

    fn arm_scan(&self, delay: std::time::Duration) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if !self.scan_armed.swap(true, Ordering::SeqCst) {
            self.scheduler.schedule(delay);
        }
    }

    // =========================================================================
    // Background paths
    // =========================================================================

    /// One lazy-write pass: turn the dirty total into a page budget, hand
    /// slices of it to the dirty streams in list order, and re-arm while
    /// dirty data remains. Streams with no write activity since the last
    /// pass yield their slice to busy ones; they, and any stream the budget
    /// starved, age via a skipped-pass counter and are serviced regardless
    /// after `max_age_target` skips.
    fn lazy_write_scan(&self) {
        self.scan_armed.store(false, Ordering::SeqCst);
        self.scan_passes.fetch_add(1, Ordering::Relaxed);
        let produced = self.throttle.take_dirtied_since_scan();
        let total = self.throttle.total_dirty();
        if total == 0 {
            trace!("scan pass found nothing dirty");
            return;
        }

        let mut budget = (total / self.config.max_age_target as u64).max(1);
        if total > self.throttle.target() {
            // Above target: keep up with the foreground production rate too.
            budget = budget.max(produced.min(total));
        }
        let available = self.backend.available_pages();
        if available < budget {
            budget = available.max(1);
        }
        debug!(total, budget, produced, "lazy write scan");

        let candidates: Vec<StreamId> = self.dirty_list.lock().iter().copied().collect();
        let max_per_stream = (self.config.max_write_behind / self.config.page_size) as u64;
        let mut remaining = budget;
        for id in candidates {
            let Some(stream) = self.streams.get(&id).map(|e| Arc::clone(&e)) else {
                continue;
            };
            if stream.flags().contains(StreamFlags::MODIFIED_NO_WRITE) {
                continue;
            }
            let dirty = stream.pages_dirty();
            if dirty == 0 {
                continue;
            }
            let active = {
                let mut state = stream.state.lock();
                std::mem::replace(&mut state.write_active, false)
            };
            let mut slice = remaining.min(max_per_stream).min(dirty);
            if !active || slice == 0 {
                let overdue = {
                    let mut state = stream.state.lock();
                    state.skipped_passes += 1;
                    state.skipped_passes >= self.config.max_age_target
                };
                if !overdue {
                    continue;
                }
                // Aged out: service it regardless of activity or budget.
                slice = max_per_stream.min(dirty);
            }
            stream.state.lock().skipped_passes = 0;
            remaining = remaining.saturating_sub(slice);
            self.dispatcher.post(WorkItem::WriteBehind { stream: id, pages: slice });
        }

        // Rotate so the same stream does not lead every pass.
        {
            let mut list = self.dirty_list.lock();
            if list.len() > 1 {
                if let Some(front) = list.pop_front() {
                    list.push_back(front);
                }
            }
        }
        if self.throttle.total_dirty() > 0 {
            self.arm_scan(self.config.idle_delay);
        }
    }

    fn write_behind(&self, id: StreamId, budget: u64) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let Some(stream) = self.streams.get(&id).map(|e| Arc::clone(&e)) else {
            return;
        };
        if !stream.callbacks().acquire_for_lazy_write(id) {
            self.write_collisions.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "write-behind collision, backing off");
            self.arm_scan(self.config.collision_delay);
            return;
        }
        let outcome = self.write_behind_some(&stream, budget);
        stream.callbacks().release_from_lazy_write(id);
        match outcome {
            Ok(_) => stream.promote_valid_data(),
            Err(err) => {
                stream.state.lock().write_failures += 1;
                warn!(%id, %err, "write-behind failed, data stays dirty");
                if err.is_retryable() {
                    self.arm_scan(self.config.collision_delay);
                }
            }
        }
        self.maybe_teardown(&stream);
    }

    /// Write up to `budget` of the stream's dirty pages: bitmap runs first
    /// (resuming where the last pass stopped), then pinned buffers by
    /// descending offset. Pinned-but-busy buffers are skipped for this pass.
    fn write_behind_some(&self, stream: &Arc<Stream>, mut budget: u64) -> Result<u64> {
        let pages_per_view = self.config.pages_per_view() as u64;
        let mut written = 0;

        while budget > 0 {
            let run = {
                let mut mask = stream.mask.lock();
                // Runs are cut at window boundaries so one run maps to one
                // view, and the resume marker moves exactly past what we
                // take.
                match mask.next_dirty_run(budget, pages_per_view) {
                    Some((first, len)) => {
                        mask.clear_range(first, first + len - 1);
                        Some((first, len))
                    }
                    None => None,
                }
            };
            let Some((first, len)) = run else { break };
            if let Err(err) = self.write_mask_run(stream, first, len) {
                // Put the bits back; the pages were never credited.
                stream.mask.lock().mark_range(first, first + len - 1);
                return Err(err);
            }
            written += len;
            budget = budget.saturating_sub(len);
        }

        if budget > 0 {
            for buffer in stream.bcbs.snapshot_descending() {
                if budget == 0 {
                    break;
                }
                if !buffer.is_dirty() {
                    continue;
                }
                if buffer.begin_flush(false).is_err() {
                    // Pinned or already being flushed; next pass.
                    self.write_collisions.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if !buffer.is_dirty() {
                    buffer.end_flush(false);
                    continue;
                }
                match self.write_out_buffer(stream, &buffer) {
                    Ok(pages) => {
                        buffer.end_flush(true);
                        self.credit_stream(stream, pages);
                        written += pages;
                        budget = budget.saturating_sub(pages);
                        self.destroy_buffer(stream, &buffer);
                    }
                    Err(err) => {
                        buffer.end_flush(false);
                        return Err(err);
                    }
                }
            }
        }
        Ok(written)
    }

    /// Write one bitmap run out through its view and retire the pages.
    fn write_mask_run(&self, stream: &Arc<Stream>, first_page: u64, pages: u64) -> Result<()> {
        let page = self.config.page_size as u64;
        let offset = first_page * page;
        let len = (pages * page) as usize;
        let mut data = vec![0_u8; len];
        self.copy_out(stream, offset, &mut data, true)?;
        let section = stream.section_size();
        let write_len = (len as u64).min(section.saturating_sub(offset)) as usize;
        if write_len > 0 {
            self.backend.write_range(stream.id(), offset, &data[..write_len])?;
        }
        self.pages_written.fetch_add(pages, Ordering::Relaxed);
        self.credit_stream(stream, pages);
        self.release_clean_window_holds(stream, first_page, first_page + pages - 1);
        Ok(())
    }

    /// Flush one pinned buffer's bytes, honoring the log barrier first.
    /// Caller holds the flush gate.
    fn write_out_buffer(&self, stream: &Arc<Stream>, buffer: &Arc<Buffer>) -> Result<u64> {
        let newest = buffer.newest_lsn();
        if newest > Lsn::ZERO {
            self.log
                .flush_to_lsn(newest)
                .map_err(|err| CacheError::LogFlush(newest, err.to_string()))?;
        }
        let range = buffer.range();
        let mut data = vec![0_u8; range.len];
        self.copy_out(stream, range.offset, &mut data, true)?;
        let section = stream.section_size();
        let write_len = (range.len as u64).min(section.saturating_sub(range.offset)) as usize;
        if write_len > 0 {
            self.backend
                .write_range(stream.id(), range.offset, &data[..write_len])?;
        }
        let pages = pages_spanned(range.offset, range.len, self.config.page_size);
        self.pages_written.fetch_add(pages, Ordering::Relaxed);
        Ok(pages)
    }

    /// Drop the dirty hold of every window in the page range that no longer
    /// has dirty bitmap bits. Bits and holds move together under the mask
    /// lock.
    fn release_clean_window_holds(&self, stream: &Arc<Stream>, first_page: u64, last_page: u64) {
        let pages_per_view = self.config.pages_per_view() as u64;
        for window in (first_page / pages_per_view)..=(last_page / pages_per_view) {
            let released = {
                let mask = stream.mask.lock();
                let win_first = window * pages_per_view;
                if (win_first..win_first + pages_per_view).any(|p| mask.is_set(p)) {
                    None
                } else {
                    let mut state = stream.state.lock();
                    match state.windows.get_mut(&(window as usize)) {
                        Some(wv) if wv.dirty_hold => {
                            wv.dirty_hold = false;
                            Some(wv.view)
                        }
                        _ => None,
                    }
                }
            };
            if let Some(vid) = released {
                self.views.release(vid);
            }
        }
    }

    /// Synchronous flush of a range (or everything) of one stream.
    fn flush(&self, stream: &Arc<Stream>, range: Option<ByteRange>) -> Result<()> {
        let section = stream.section_size();
        let range = range.unwrap_or(ByteRange::new(0, section as usize));
        if range.len == 0 {
            return Ok(());
        }
        let page = self.config.page_size as u64;
        let pages_per_view = self.config.pages_per_view() as u64;
        let first = range.offset / page;
        let last = (range.beyond() - 1) / page;

        // Bitmap pages.
        let mut cursor = first;
        while cursor <= last {
            let run = {
                let mut mask = stream.mask.lock();
                let mut p = cursor;
                while p <= last && !mask.is_set(p) {
                    p += 1;
                }
                if p > last {
                    None
                } else {
                    let window_last = (p / pages_per_view + 1) * pages_per_view - 1;
                    let cap = (window_last.min(last) - p) + 1;
                    let mut n = 1;
                    while n < cap && mask.is_set(p + n) {
                        n += 1;
                    }
                    mask.clear_range(p, p + n - 1);
                    Some((p, n))
                }
            };
            let Some((p, n)) = run else { break };
            if let Err(err) = self.write_mask_run(stream, p, n) {
                stream.mask.lock().mark_range(p, p + n - 1);
                stream.state.lock().write_failures += 1;
                return Err(err);
            }
            cursor = p + n;
        }

        // Pinned buffers, waiting out pinners.
        for buffer in stream.bcbs.find_overlapping(range) {
            if !buffer.is_dirty() {
                continue;
            }
            buffer.begin_flush(true)?;
            if !buffer.is_dirty() {
                buffer.end_flush(false);
                continue;
            }
            match self.write_out_buffer(stream, &buffer) {
                Ok(pages) => {
                    buffer.end_flush(true);
                    self.credit_stream(stream, pages);
                    self.destroy_buffer(stream, &buffer);
                }
                Err(err) => {
                    buffer.end_flush(false);
                    stream.state.lock().write_failures += 1;
                    return Err(err);
                }
            }
        }
        stream.promote_valid_data();
        self.maybe_teardown(stream);
        Ok(())
    }

    fn perform_read_ahead(&self, instance: &Arc<OpenInstance>, range: ByteRange) {
        let stream = &instance.stream;
        let outcome = (|| -> Result<()> {
            if stream.is_tearing_down() || self.shutting_down.load(Ordering::Acquire) {
                return Ok(());
            }
            let section = stream.section_size();
            if range.offset >= section {
                return Ok(());
            }
            let gran = self.config.view_granularity;
            let end = range.beyond().min(section);
            let mut cur = range.offset;
            while cur < end {
                let window = window_index(cur, gran);
                let (vid, _) = self.view_for_window(stream, window, true)?;
                self.views.release(vid);
                cur = (window as u64 + 1) * gran;
            }
            Ok(())
        })();
        instance.read_ahead.lock().complete();
        match outcome {
            Ok(()) => {
                self.read_aheads.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => debug!(id = %stream.id(), %err, "read-ahead abandoned"),
        }
    }

    /// Unbind idle, clean views trailing a sequential reader.
    fn release_trailing_windows(&self, stream: &Arc<Stream>, keep_from: u64) {
        let gran = self.config.view_granularity;
        let pages_per_view = self.config.pages_per_view() as u64;
        let keep_window = window_index(keep_from, gran);
        let id = stream.id();
        let mut victims: Vec<ViewId> = Vec::new();
        {
            let mask = stream.mask.lock();
            let mut state = stream.state.lock();
            let views = &self.views;
            state.windows.retain(|&window, wv| {
                if window >= keep_window || wv.dirty_hold {
                    return true;
                }
                let first = window as u64 * pages_per_view;
                if (first..first + pages_per_view).any(|p| mask.is_set(p)) {
                    return true;
                }
                let bound = views.binding(wv.view)
                    == (ViewBinding::Bound {
                        stream: id,
                        offset: window as u64 * gran,
                    });
                if bound && views.active_count(wv.view) == 0 {
                    victims.push(wv.view);
                    return false;
                }
                true
            });
            if matches!(state.active_window, Some((w, _)) if w < keep_window) {
                state.active_window = None;
            }
        }
        for vid in victims {
            self.views.unbind(vid);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    fn maybe_teardown(&self, stream: &Arc<Stream>) {
        let ready = {
            let state = stream.state.lock();
            state.teardown && state.open_count == 0 && state.pages_dirty == 0
        };
        if ready {
            self.dispatcher.post(WorkItem::TeardownStream {
                stream: stream.id(),
            });
        }
    }

    /// Retire a stream whose last opener is gone and whose dirty data has
    /// drained. A racing reopen wins: the removal and the liveness check are
    /// atomic against the streams map.
    fn finish_teardown(&self, id: StreamId) {
        let removed = self.streams.remove_if(&id, |_, stream| {
            let state = stream.state.lock();
            state.teardown && state.open_count == 0 && state.pages_dirty == 0
        });
        let Some((_, stream)) = removed else {
            return;
        };
        stream.callbacks().acquire_for_close(id);
        {
            let _guard = stream.pin_lock.lock();
            self.sweep_destroyable(&stream);
        }
        let windows: Vec<(usize, WindowView)> = {
            let mut state = stream.state.lock();
            state.active_window = None;
            state.windows.drain().collect()
        };
        let gran = self.config.view_granularity;
        for (window, wv) in windows {
            debug_assert!(!wv.dirty_hold, "dirty hold survived drain");
            let bound = self.views.binding(wv.view)
                == (ViewBinding::Bound {
                    stream: id,
                    offset: window as u64 * gran,
                });
            if bound {
                self.views.unbind(wv.view);
            }
        }
        {
            let mut list = self.dirty_list.lock();
            list.retain(|s| *s != id);
        }
        stream.callbacks().release_from_close(id);
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        info!(%id, "stream cache torn down");
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        let ids: Vec<StreamId> = self.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            let stream = self.streams.get(&id).map(|e| Arc::clone(&e));
            if let Some(stream) = stream {
                if let Err(err) = self.flush(&stream, None) {
                    warn!(%id, %err, "flush during shutdown failed");
                }
            }
        }
        self.dispatcher.shutdown();
        info!("cache manager stopped");
    }

    fn stats(&self) -> CacheStats {
        let (binds, victimized, reference_hits) = self.views.stats();
        CacheStats {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            read_aheads: self.read_aheads.load(Ordering::Relaxed),
            view_binds: binds,
            view_victimizations: victimized,
            view_reference_hits: reference_hits,
            scan_passes: self.scan_passes.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            write_collisions: self.write_collisions.load(Ordering::Relaxed),
            deferred_writes: self.throttle.deferred_writes(),
            dirty_pages: self.throttle.total_dirty(),
            cached_streams: self.streams.len(),
            teardowns: self.teardowns.load(Ordering::Relaxed),
        }
    }
}

impl WorkHandler for CacheShared {
    fn execute(&self, item: WorkItem) {
        match item {
            WorkItem::ReadAhead { instance, range } => self.perform_read_ahead(&instance, range),
            WorkItem::WriteBehind { stream, pages } => self.write_behind(stream, pages),
            WorkItem::LazyWriteScan => self.lazy_write_scan(),
            WorkItem::TeardownStream { stream } => self.finish_teardown(stream),
        }
    }
}

impl ScanTarget for CacheShared {
    fn scan_due(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        self.dispatcher.post(WorkItem::LazyWriteScan);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, NoopCallbacks, NullLog};

    fn manager(backend: &Arc<MemoryBackend>) -> CacheManager {
        manager_with(backend, CacheConfig::for_testing())
    }

    fn manager_with(backend: &Arc<MemoryBackend>, config: CacheConfig) -> CacheManager {
        CacheManager::new(
            config,
            Arc::clone(backend) as Arc<dyn MappingBackend>,
            Arc::new(NullLog::new()) as Arc<dyn LogHandle>,
        )
        .expect("manager")
    }

    /// Lazy writer effectively disabled, for deterministic dirty counts.
    fn slow_scan_config() -> CacheConfig {
        CacheConfig {
            first_delay: std::time::Duration::from_secs(60),
            idle_delay: std::time::Duration::from_secs(60),
            ..CacheConfig::for_testing()
        }
    }

    fn open(mgr: &CacheManager, id: u64, len: usize, backend: &Arc<MemoryBackend>) -> CacheHandle {
        backend.create_stream(StreamId(id), len);
        mgr.open(
            StreamId(id),
            OpenOptions {
                flags: StreamFlags::PIN_ACCESS,
                ..Default::default()
            },
            Arc::new(NoopCallbacks::new()),
        )
        .expect("open")
    }

    #[test]
    fn test_read_returns_backing_bytes() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        backend.create_stream(StreamId(1), 8192);
        backend
            .write_range(StreamId(1), 100, &[0xAA_u8; 50])
            .expect("seed");
        let handle = mgr
            .open(
                StreamId(1),
                OpenOptions::default(),
                Arc::new(NoopCallbacks::new()),
            )
            .expect("open");
        let bytes = handle.read(100, 50).expect("read");
        assert_eq!(&bytes[..], &[0xAA_u8; 50]);
    }

    #[test]
    fn test_read_beyond_section_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 4096, &backend);
        assert!(matches!(
            handle.read(4000, 200),
            Err(CacheError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_write_read_round_trip_through_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        handle.write(1000, &[0x5C_u8; 3000]).expect("write");
        let bytes = handle.read(1000, 3000).expect("read");
        assert_eq!(&bytes[..], &[0x5C_u8; 3000]);
        // Not yet on the backing store, but dirty and accounted.
        assert!(handle.dirty_pages() > 0);
        assert_eq!(mgr.dirty_pages(), handle.dirty_pages());
    }

    #[test]
    fn test_flush_lands_on_backing_store() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        handle.write(4096, &[0x11_u8; 4096]).expect("write");
        handle.flush(None).expect("flush");
        assert_eq!(handle.dirty_pages(), 0);
        assert_eq!(mgr.dirty_pages(), 0);
        let contents = backend.contents(StreamId(1)).expect("contents");
        assert_eq!(&contents[4096..8192], &[0x11_u8; 4096]);
    }

    #[test]
    fn test_second_read_hits_the_view() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        handle.read(0, 512).expect("read");
        handle.read(512, 512).expect("read");
        let stats = mgr.stats();
        assert!(stats.read_hits >= 1);
        assert_eq!(stats.read_misses, 1);
    }

    #[test]
    fn test_pin_mark_dirty_unpin_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        let pin = handle.pin(0, 8192, true).expect("pin");
        handle.write_pinned(&pin, 0, &[0x42_u8; 8192]).expect("write");
        handle.mark_dirty(&pin, Some((Lsn(1), Lsn(2))));
        assert_eq!(handle.dirty_pages(), 2);
        handle.unpin(pin, UnpinAction::Unpin);
        handle.flush(None).expect("flush");
        let contents = backend.contents(StreamId(1)).expect("contents");
        assert_eq!(&contents[..8192], &[0x42_u8; 8192]);
        assert_eq!(handle.dirty_pages(), 0);
    }

    #[test]
    fn test_unpin_set_clean_discards_dirt() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        let pin = handle.pin(0, 4096, true).expect("pin");
        handle.mark_dirty(&pin, None);
        assert_eq!(handle.dirty_pages(), 1);
        handle.unpin(pin, UnpinAction::SetClean);
        assert_eq!(handle.dirty_pages(), 0);
        assert_eq!(mgr.dirty_pages(), 0);
    }

    #[test]
    fn test_pin_is_idempotent_per_balanced_unpin() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        let a = handle.pin(0, 4096, true).expect("pin");
        let b = handle.pin(0, 4096, true).expect("pin");
        handle.unpin(a, UnpinAction::Unpin);
        // Still pinned through b.
        assert_eq!(handle.instance.stream.pinned_buffers(), 1);
        handle.unpin(b, UnpinAction::Unpin);
        assert_eq!(handle.instance.stream.pinned_buffers(), 0);
    }

    #[test]
    fn test_pin_spanning_existing_pins_overlaps() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        let a = handle.pin(0, 4096, true).expect("pin a");
        let b = handle.pin(8192, 4096, true).expect("pin b");
        let span = handle.pin(0, 12288, true).expect("pin span");
        assert!(span.is_overlap());
        handle.unpin(span, UnpinAction::Unpin);
        handle.unpin(a, UnpinAction::Unpin);
        handle.unpin(b, UnpinAction::Unpin);
    }

    #[test]
    fn test_try_write_refused_past_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 4 << 20, &backend);
        // Test config threshold is 64 pages.
        handle.write(0, &vec![1_u8; 60 * 4096]).expect("write");
        assert!(matches!(
            handle.try_write(1 << 20, &vec![1_u8; 8 * 4096]),
            Err(CacheError::WouldBlock)
        ));
        handle.flush(None).expect("flush");
        handle
            .try_write(1 << 20, &vec![1_u8; 8 * 4096])
            .expect("admitted after flush");
    }

    #[test]
    fn test_per_stream_limit_refuses_early() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 1 << 20, &backend);
        handle.set_dirty_page_limit(Some(4));
        handle.write(0, &vec![1_u8; 4 * 4096]).expect("write");
        assert!(matches!(
            handle.try_write(64 * 1024, &[1_u8; 4096]),
            Err(CacheError::WouldBlock)
        ));
    }

    #[test]
    fn test_lazy_writer_drains_dirty_pages() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 1 << 20, &backend);
        handle.write(0, &vec![0x77_u8; 16 * 4096]).expect("write");
        let start = std::time::Instant::now();
        while mgr.dirty_pages() > 0 && start.elapsed() < std::time::Duration::from_secs(5) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(mgr.dirty_pages(), 0);
        let contents = backend.contents(StreamId(1)).expect("contents");
        assert_eq!(&contents[..16 * 4096], &vec![0x77_u8; 16 * 4096][..]);
        assert!(mgr.stats().scan_passes >= 1);
    }

    #[test]
    fn test_close_tears_down_clean_stream() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        handle.read(0, 4096).expect("read");
        drop(handle);
        let start = std::time::Instant::now();
        while mgr.stats().cached_streams > 0
            && start.elapsed() < std::time::Duration::from_secs(5)
        {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let stats = mgr.stats();
        assert_eq!(stats.cached_streams, 0);
        assert_eq!(stats.teardowns, 1);
    }

    #[test]
    fn test_reopen_joins_existing_cache_state() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let first = open(&mgr, 1, 64 * 1024, &backend);
        first.write(0, &[9_u8; 100]).expect("write");
        let second = mgr
            .open(
                StreamId(1),
                OpenOptions::default(),
                Arc::new(NoopCallbacks::new()),
            )
            .expect("reopen");
        drop(first);
        // The surviving opener still sees the cached write.
        let bytes = second.read(0, 100).expect("read");
        assert_eq!(&bytes[..], &[9_u8; 100]);
        assert_eq!(mgr.stats().cached_streams, 1);
    }

    #[test]
    fn test_write_failure_keeps_pages_dirty() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        handle.write(0, &[3_u8; 4096]).expect("write");
        backend.fail_next_write();
        assert!(handle.flush(None).is_err());
        assert_eq!(handle.dirty_pages(), 1);
        assert_eq!(mgr.dirty_pages(), 1);
        // Second attempt succeeds and drains.
        handle.flush(None).expect("flush");
        assert_eq!(handle.dirty_pages(), 0);
        drop(handle);
        mgr.shutdown();
    }

    #[test]
    fn test_modified_no_write_skips_throttle_and_lazy_writer() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        backend.create_stream(StreamId(1), 1 << 20);
        let handle = mgr
            .open(
                StreamId(1),
                OpenOptions {
                    flags: StreamFlags::MODIFIED_NO_WRITE,
                    ..Default::default()
                },
                Arc::new(NoopCallbacks::new()),
            )
            .expect("open");
        handle.write(0, &vec![1_u8; 8 * 4096]).expect("write");
        assert_eq!(handle.dirty_pages(), 8);
        // Not charged against the global threshold.
        assert_eq!(mgr.dirty_pages(), 0);
        std::thread::sleep(std::time::Duration::from_millis(100));
        // The lazy writer left it alone; explicit flush drains it.
        assert_eq!(handle.dirty_pages(), 8);
        handle.flush(None).expect("flush");
        assert_eq!(handle.dirty_pages(), 0);
    }

    #[test]
    fn test_mark_dirty_range_flushes_view_modifications() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        // Modify through a pin, release it without marking, then mark the
        // range through the bitmap path.
        let pin = handle.pin(0, 4096, true).expect("pin");
        handle.write_pinned(&pin, 0, &[0x6D_u8; 4096]).expect("write");
        handle.unpin(pin, UnpinAction::Unpin);
        assert_eq!(handle.dirty_pages(), 0);
        handle.mark_dirty_range(0, 4096).expect("mark");
        assert_eq!(handle.dirty_pages(), 1);
        handle.flush(None).expect("flush");
        let contents = backend.contents(StreamId(1)).expect("contents");
        assert_eq!(&contents[..4096], &[0x6D_u8; 4096]);
    }

    #[test]
    fn test_requested_scan_drains_without_timer() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 1 << 20, &backend);
        handle.write(0, &vec![8_u8; 4 * 4096]).expect("write");
        mgr.cancel_scan();
        assert_eq!(mgr.dirty_pages(), 4);
        // Each requested pass retires its budgeted slice; pump until drained.
        let start = std::time::Instant::now();
        while mgr.dirty_pages() > 0 && start.elapsed() < std::time::Duration::from_secs(5) {
            mgr.request_scan();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(mgr.dirty_pages(), 0);
    }

    #[test]
    fn test_read_beyond_valid_data_returns_zeros() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        backend.create_stream(StreamId(1), 16384);
        // Stale bytes past the declared valid length must never surface.
        backend
            .write_range(StreamId(1), 0, &[0xFF_u8; 16384])
            .expect("seed");
        let handle = mgr
            .open(
                StreamId(1),
                OpenOptions {
                    valid_data_length: Some(4096),
                    ..Default::default()
                },
                Arc::new(NoopCallbacks::new()),
            )
            .expect("open");
        let head = handle.read(0, 4096).expect("read");
        assert_eq!(&head[..], &[0xFF_u8; 4096]);
        let tail = handle.read(4096, 4096).expect("read");
        assert_eq!(&tail[..], &[0_u8; 4096]);
        // A straddling read zeros only the part past the mark.
        let mix = handle.read(4000, 200).expect("read");
        assert_eq!(&mix[..96], &[0xFF_u8; 96]);
        assert_eq!(&mix[96..], &[0_u8; 104]);
    }

    #[test]
    fn test_write_past_goal_zero_fills_the_gap() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        backend.create_stream(StreamId(1), 16384);
        backend
            .write_range(StreamId(1), 0, &[0xFF_u8; 16384])
            .expect("seed");
        let handle = mgr
            .open(
                StreamId(1),
                OpenOptions {
                    valid_data_length: Some(4096),
                    ..Default::default()
                },
                Arc::new(NoopCallbacks::new()),
            )
            .expect("open");
        handle.write(12288, &[0x5A_u8; 100]).expect("write");
        // The never-written gap reads as zeros, data below the old mark
        // survives.
        let gap = handle.read(8192, 100).expect("read");
        assert_eq!(&gap[..], &[0_u8; 100]);
        let head = handle.read(0, 100).expect("read");
        assert_eq!(&head[..], &[0xFF_u8; 100]);
        handle.flush(None).expect("flush");
        let contents = backend.contents(StreamId(1)).expect("contents");
        assert_eq!(&contents[4096..12288], &vec![0_u8; 8192][..]);
        assert_eq!(&contents[12288..12388], &[0x5A_u8; 100]);
        // Flush drained the stream: the valid mark catches up to the goal.
        assert_eq!(handle.valid_data_length(), 12388);
    }

    #[test]
    fn test_try_read_refuses_to_fault_windows_in() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 64 * 1024, &backend);
        assert!(matches!(
            handle.try_read(0, 512),
            Err(CacheError::WouldBlock)
        ));
        // Once resident, the non-blocking form succeeds.
        handle.read(0, 512).expect("read");
        handle.try_read(0, 512).expect("resident try_read");
    }

    #[test]
    fn test_flush_promotes_valid_data() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        backend.create_stream(StreamId(1), 0);
        let handle = mgr
            .open(
                StreamId(1),
                OpenOptions::default(),
                Arc::new(NoopCallbacks::new()),
            )
            .expect("open");
        handle.write(0, &[7_u8; 4096]).expect("write");
        // Dirty data holds the mark back until the flush lands it.
        assert_eq!(handle.valid_data_length(), 0);
        handle.flush(None).expect("flush");
        assert_eq!(handle.valid_data_length(), 4096);
    }

    #[test]
    fn test_admission_callback_fires_as_pages_retire() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager_with(&backend, slow_scan_config());
        let handle = open(&mgr, 1, 4 << 20, &backend);
        // Test config threshold is 64 pages.
        handle.write(0, &vec![1_u8; 60 * 4096]).expect("write");
        let ctx = Arc::new(AtomicU64::new(0));
        let ctx2 = Arc::clone(&ctx);
        let granted = handle.request_admission(
            8 * 4096,
            Box::new(move |a, b| {
                ctx2.store(a << 32 | b, Ordering::SeqCst);
            }),
            (0x11, 0x22),
        );
        assert!(!granted);
        assert_eq!(ctx.load(Ordering::SeqCst), 0);
        // Retiring the dirty pages admits the ticket and fires the callback
        // with its context words.
        handle.flush(None).expect("flush");
        mgr.post_deferred_writes();
        assert_eq!(ctx.load(Ordering::SeqCst), 0x11 << 32 | 0x22);
        // With capacity free again, admission is immediate.
        assert!(handle.request_admission(4096, Box::new(|_, _| {}), (0, 0)));
    }

    #[test]
    fn test_write_extends_section() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = manager(&backend);
        let handle = open(&mgr, 1, 4096, &backend);
        handle.write(8000, &[5_u8; 100]).expect("write");
        let bytes = handle.read(8000, 100).expect("read");
        assert_eq!(&bytes[..], &[5_u8; 100]);
        handle.flush(None).expect("flush");
        assert!(backend.stream_len(StreamId(1)).expect("len") >= 8100);
    }
}
