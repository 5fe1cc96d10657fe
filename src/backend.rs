//! External Collaborator Ports
//!
//! The cache core consumes three capabilities it does not implement: the
//! mapping service that binds views to backing data, the per-stream locking
//! callbacks supplied by the file-system driver, and the write-ahead log's
//! durability barrier. Each is a trait here, with in-memory reference
//! implementations used by the test suite and by embedders prototyping
//! against the cache.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{CacheError, Result};
use crate::types::{Lsn, StreamId};

/// Mapping/backing service: binds view windows to stream data and accepts
/// flushed ranges. Mirrors the slice of the virtual-memory subsystem the
/// cache actually calls; page-fault servicing and eviction stay on the other
/// side of this boundary.
pub trait MappingBackend: Send + Sync {
    /// Current backing length of the stream in bytes.
    fn stream_len(&self, stream: StreamId) -> Result<u64>;

    /// Read up to `len` bytes at `offset` into a freshly bound view buffer.
    /// Short reads past end-of-stream return the available prefix.
    fn map_range(&self, stream: StreamId, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Persist `data` at `offset`, extending the stream if needed.
    fn write_range(&self, stream: StreamId, offset: u64, data: &[u8]) -> Result<()>;

    /// Pages the platform could still give out; the lazy writer shrinks its
    /// per-pass budget as this approaches zero.
    fn available_pages(&self) -> u64;
}

/// Per-stream locking callbacks supplied by the file-system driver when the
/// stream is cached, so background flushes order correctly against the
/// driver's own locks.
pub trait StreamCallbacks: Send + Sync {
    /// Acquire the stream for lazy write. Returning `false` signals a
    /// collision with a foreground holder; the flush backs off and retries.
    fn acquire_for_lazy_write(&self, stream: StreamId) -> bool;

    /// Release after lazy write.
    fn release_from_lazy_write(&self, stream: StreamId);

    /// Acquire the stream for teardown; may block.
    fn acquire_for_close(&self, stream: StreamId);

    /// Release after teardown.
    fn release_from_close(&self, stream: StreamId);
}

/// Log durability barrier: block until the log is durable up to `lsn`.
pub trait LogHandle: Send + Sync {
    fn flush_to_lsn(&self, lsn: Lsn) -> Result<()>;
}

// =============================================================================
// Reference implementations
// =============================================================================

/// In-memory backing store keyed by stream id.
///
/// Each stream is one growable byte vector. Supports configurable
/// available-page pressure and one-shot write fault injection so error paths
/// can be exercised deterministically.
pub struct MemoryBackend {
    streams: DashMap<StreamId, RwLock<Vec<u8>>>,
    available_pages: AtomicU64,
    fail_next_write: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            available_pages: AtomicU64::new(u64::MAX),
            fail_next_write: AtomicBool::new(false),
        }
    }

    /// Create (or reset) a stream with `len` zero bytes.
    pub fn create_stream(&self, stream: StreamId, len: usize) {
        self.streams.insert(stream, RwLock::new(vec![0_u8; len]));
    }

    /// Snapshot of the current backing bytes, for assertions.
    pub fn contents(&self, stream: StreamId) -> Option<Vec<u8>> {
        self.streams.get(&stream).map(|s| s.read().clone())
    }

    /// Simulate memory pressure for budget tests.
    pub fn set_available_pages(&self, pages: u64) {
        self.available_pages.store(pages, Ordering::Relaxed);
    }

    /// Make the next `write_range` fail with a backing error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::Relaxed);
    }
}

impl MappingBackend for MemoryBackend {
    fn stream_len(&self, stream: StreamId) -> Result<u64> {
        let entry = self
            .streams
            .get(&stream)
            .ok_or(CacheError::StreamTornDown(stream))?;
        let len = entry.read().len() as u64;
        Ok(len)
    }

    fn map_range(&self, stream: StreamId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let entry = self
            .streams
            .get(&stream)
            .ok_or(CacheError::StreamTornDown(stream))?;
        let data = entry.read();
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_range(&self, stream: StreamId, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::Relaxed) {
            return Err(CacheError::Backing {
                stream,
                offset,
                reason: "injected write fault".into(),
            });
        }
        let entry = self
            .streams
            .get(&stream)
            .ok_or(CacheError::StreamTornDown(stream))?;
        let mut data = entry.write();
        let end = offset as usize + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn available_pages(&self) -> u64 {
        self.available_pages.load(Ordering::Relaxed)
    }
}

/// Log handle that records the highest token flushed, without a real log.
pub struct NullLog {
    durable: AtomicU64,
}

impl Default for NullLog {
    fn default() -> Self {
        Self::new()
    }
}

impl NullLog {
    pub fn new() -> Self {
        Self {
            durable: AtomicU64::new(0),
        }
    }

    /// Highest token a flush barrier has been requested for.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable.load(Ordering::Acquire))
    }
}

impl LogHandle for NullLog {
    fn flush_to_lsn(&self, lsn: Lsn) -> Result<()> {
        self.durable.fetch_max(lsn.0, Ordering::AcqRel);
        Ok(())
    }
}

/// Driver callbacks that never block. `hold()` makes the next lazy-write
/// acquisition collide, for backoff tests.
pub struct NoopCallbacks {
    busy: AtomicBool,
    lazy_write_acquires: AtomicU64,
}

impl Default for NoopCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopCallbacks {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            lazy_write_acquires: AtomicU64::new(0),
        }
    }

    /// Refuse lazy-write acquisitions until `release_hold`.
    pub fn hold(&self) {
        self.busy.store(true, Ordering::Release);
    }

    pub fn release_hold(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Number of successful lazy-write acquisitions.
    pub fn lazy_write_acquires(&self) -> u64 {
        self.lazy_write_acquires.load(Ordering::Relaxed)
    }
}

impl StreamCallbacks for NoopCallbacks {
    fn acquire_for_lazy_write(&self, _stream: StreamId) -> bool {
        if self.busy.load(Ordering::Acquire) {
            return false;
        }
        self.lazy_write_acquires.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn release_from_lazy_write(&self, _stream: StreamId) {}

    fn acquire_for_close(&self, _stream: StreamId) {}

    fn release_from_close(&self, _stream: StreamId) {}
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        let id = StreamId(1);
        backend.create_stream(id, 8192);

        backend.write_range(id, 4096, &[7_u8; 100]).expect("write");
        let read = backend.map_range(id, 4096, 100).expect("read");
        assert_eq!(read, vec![7_u8; 100]);
    }

    #[test]
    fn test_memory_backend_short_read_at_eof() {
        let backend = MemoryBackend::new();
        let id = StreamId(2);
        backend.create_stream(id, 100);

        let read = backend.map_range(id, 50, 100).expect("read");
        assert_eq!(read.len(), 50);
    }

    #[test]
    fn test_memory_backend_extends_on_write() {
        let backend = MemoryBackend::new();
        let id = StreamId(3);
        backend.create_stream(id, 10);

        backend.write_range(id, 100, &[1_u8; 10]).expect("write");
        assert_eq!(backend.stream_len(id).expect("len"), 110);
    }

    #[test]
    fn test_memory_backend_fault_injection() {
        let backend = MemoryBackend::new();
        let id = StreamId(4);
        backend.create_stream(id, 0);

        backend.fail_next_write();
        assert!(backend.write_range(id, 0, &[0_u8; 4]).is_err());
        // One-shot: the next write succeeds.
        backend.write_range(id, 0, &[0_u8; 4]).expect("write");
    }

    #[test]
    fn test_unknown_stream_is_reported() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.stream_len(StreamId(99)),
            Err(CacheError::StreamTornDown(StreamId(99)))
        ));
    }

    #[test]
    fn test_null_log_tracks_highest_token() {
        let log = NullLog::new();
        log.flush_to_lsn(Lsn(10)).expect("flush");
        log.flush_to_lsn(Lsn(5)).expect("flush");
        assert_eq!(log.durable_lsn(), Lsn(10));
    }

    #[test]
    fn test_callbacks_collision_injection() {
        let cb = NoopCallbacks::new();
        assert!(cb.acquire_for_lazy_write(StreamId(1)));
        cb.hold();
        assert!(!cb.acquire_for_lazy_write(StreamId(1)));
        cb.release_hold();
        assert!(cb.acquire_for_lazy_write(StreamId(1)));
        assert_eq!(cb.lazy_write_acquires(), 2);
    }
}
