//! # streamcache
//!
//! Page-granular caching of file stream data with lazy write-back, built for
//! embedding under a file-system or storage engine.
//!
//! The cache exposes stream data through a fixed pool of granularity-aligned
//! view windows. Reads and writes are memory copies against those views;
//! dirty pages are tracked per stream (a bitmap for bulk writes, pinned
//! buffers for explicitly coordinated updates) and written back by a
//! background lazy writer that spreads the work over several passes. A
//! system-wide dirty threshold defers foreground writers, FIFO, when
//! write-back falls behind.
//!
//! ## Architecture
//!
//! - [`manager`]: the [`CacheManager`] core and per-open [`CacheHandle`].
//! - [`backend`]: the traits the embedder implements (mapping service,
//!   per-stream lock callbacks, log durability barrier).
//! - [`stream`]: per-stream cache state and caching-mode flags.
//! - [`buffer`]: pinned-buffer registry and the dirty-page bitmap.
//! - Internal: the view pool, read-ahead prediction, dirty throttling, the
//!   worker pool and the scan clock.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use streamcache::{
//!     CacheConfig, CacheManager, MemoryBackend, NoopCallbacks, NullLog, OpenOptions, StreamId,
//! };
//!
//! # fn main() -> streamcache::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! backend.create_stream(StreamId(1), 64 * 1024);
//!
//! let cache = CacheManager::new(CacheConfig::default(), backend, Arc::new(NullLog::new()))?;
//! let handle = cache.open(StreamId(1), OpenOptions::default(), Arc::new(NoopCallbacks::new()))?;
//!
//! handle.write(0, b"hello")?;
//! assert_eq!(&handle.read(0, 5)?[..], b"hello");
//! handle.flush(None)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod stream;
pub mod types;

mod dispatcher;
mod readahead;
mod scheduler;
mod throttle;
mod view;

pub use backend::{
    LogHandle, MappingBackend, MemoryBackend, NoopCallbacks, NullLog, StreamCallbacks,
};
pub use buffer::{PinnedRange, UnpinAction};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use manager::{CacheHandle, CacheManager, CacheStats, OpenOptions};
pub use stream::StreamFlags;
pub use throttle::AdmitFn;
pub use types::{ByteRange, Lsn, StreamId};
