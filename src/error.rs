//! Error types for the cache manager

use thiserror::Error;

use crate::types::StreamId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by cache operations.
///
/// Invariant violations (unbalanced unpin, a dirty page unreachable from the
/// dirty list) are not represented here: the design makes those states
/// unreachable and the test suite asserts them directly.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error from the embedder's plumbing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing-store or mapping-service failure for a specific stream range
    #[error("backing store failure on {stream} at offset {offset}: {reason}")]
    Backing {
        stream: StreamId,
        offset: u64,
        reason: String,
    },

    /// A non-blocking operation could not proceed without waiting
    #[error("operation would block")]
    WouldBlock,

    /// Views, buffers or worker capacity exhausted under memory pressure
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The stream is gone or being torn down
    #[error("{0} is not cached or is being torn down")]
    StreamTornDown(StreamId),

    /// Request lies outside the stream's section
    #[error("range [{offset}, {offset}+{len}) exceeds section size {section_size} of {stream}")]
    InvalidRange {
        stream: StreamId,
        offset: u64,
        len: usize,
        section_size: u64,
    },

    /// Log durability barrier failed; the dirty data stays dirty
    #[error("log flush to {0} failed: {1}")]
    LogFlush(crate::types::Lsn, String),
}

impl CacheError {
    /// True for failures that a later write-behind pass should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Io(_)
                | CacheError::Backing { .. }
                | CacheError::WouldBlock
                | CacheError::ResourceExhausted(_)
                | CacheError::LogFlush(..)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
