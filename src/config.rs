//! Cache Configuration
//!
//! Every tuning knob of the cache is a field here. The original system hid
//! most of these behind compile-time constants plus a memory-size "tune"
//! heuristic; embedders of this crate size them explicitly instead.

use std::time::Duration;

/// Default view window size (256 KiB).
pub const DEFAULT_VIEW_GRANULARITY: u64 = 256 * 1024;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default clamp on a single read-ahead transfer (64 KiB).
pub const DEFAULT_MAX_READ_AHEAD: usize = 64 * 1024;

/// Default clamp on a single write-behind transfer (64 KiB).
pub const DEFAULT_MAX_WRITE_BEHIND: usize = 64 * 1024;

/// Low-order offset bits ignored by the sequential-access detector.
pub const DEFAULT_NOISE_MASK: u64 = 0x7;

/// Passes between services of streams with no foreground write activity,
/// and the divisor for the per-pass write budget.
pub const DEFAULT_MAX_AGE_TARGET: u32 = 8;

/// Configuration for a [`CacheManager`](crate::CacheManager).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Page size in bytes; must be a power of two.
    pub page_size: usize,
    /// View window size in bytes; must be a power-of-two multiple of the page
    /// size. Every mapping is aligned to this granularity.
    pub view_granularity: u64,
    /// Number of preallocated views in the global pool. Sized to a fraction
    /// of physical memory by the embedder.
    pub view_count: usize,

    /// Dirty pages at which new writers are deferred.
    pub dirty_page_threshold: u64,
    /// Dirty pages the lazy writer drives toward each pass.
    pub dirty_page_target: u64,

    /// Delay between lazy-write scans while dirty data remains.
    pub idle_delay: Duration,
    /// Delay from first dirty page to the first scan.
    pub first_delay: Duration,
    /// Re-arm delay after a write-behind collides with a foreground lock.
    pub collision_delay: Duration,
    /// Streams with no write activity are serviced every Nth pass; also the
    /// divisor turning total dirty pages into a per-pass budget.
    pub max_age_target: u32,

    /// Upper bound on one read-ahead transfer, in bytes.
    pub max_read_ahead: usize,
    /// Upper bound on one write-behind transfer per stream per pass, in bytes.
    pub max_write_behind: usize,
    /// Read-ahead granularity; predicted targets are aligned to this.
    pub read_ahead_granularity: u64,
    /// Low-order bits masked off when comparing access windows for
    /// sequential-pattern detection.
    pub noise_mask: u64,

    /// For sequential-only streams, how far a view may trail the access
    /// cursor before it is released eagerly.
    pub sequential_map_limit: u64,

    /// Stream size past which the pinned-buffer list is sharded.
    pub bcb_list_threshold: u64,
    /// Byte span covered by one buffer-list shard once sharded.
    pub bcb_shard_span: u64,

    /// Worker pool floor; idle workers above this exit after
    /// `worker_idle_timeout`.
    pub min_worker_threads: usize,
    /// Worker pool ceiling.
    pub max_worker_threads: usize,
    /// Idle parking time before a surplus worker exits.
    pub worker_idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            view_granularity: DEFAULT_VIEW_GRANULARITY,
            view_count: 64,
            dirty_page_threshold: 1024,
            dirty_page_target: 512,
            idle_delay: Duration::from_secs(1),
            first_delay: Duration::from_secs(3),
            collision_delay: Duration::from_millis(100),
            max_age_target: DEFAULT_MAX_AGE_TARGET,
            max_read_ahead: DEFAULT_MAX_READ_AHEAD,
            max_write_behind: DEFAULT_MAX_WRITE_BEHIND,
            read_ahead_granularity: DEFAULT_PAGE_SIZE as u64,
            noise_mask: DEFAULT_NOISE_MASK,
            sequential_map_limit: 512 * 1024,
            bcb_list_threshold: 2 * 1024 * 1024,
            bcb_shard_span: 512 * 1024,
            min_worker_threads: 1,
            max_worker_threads: 4,
            worker_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Validate internal consistency. Called by `CacheManager::new`.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CacheError;

        if !self.page_size.is_power_of_two() {
            return Err(CacheError::ResourceExhausted(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if !self.view_granularity.is_power_of_two()
            || self.view_granularity % self.page_size as u64 != 0
        {
            return Err(CacheError::ResourceExhausted(format!(
                "view_granularity {} must be a power-of-two multiple of page_size {}",
                self.view_granularity, self.page_size
            )));
        }
        if self.view_count == 0 {
            return Err(CacheError::ResourceExhausted(
                "view_count must be > 0".into(),
            ));
        }
        if self.dirty_page_target > self.dirty_page_threshold {
            return Err(CacheError::ResourceExhausted(format!(
                "dirty_page_target {} exceeds dirty_page_threshold {}",
                self.dirty_page_target, self.dirty_page_threshold
            )));
        }
        if self.max_age_target == 0 {
            return Err(CacheError::ResourceExhausted(
                "max_age_target must be > 0".into(),
            ));
        }
        if self.min_worker_threads > self.max_worker_threads || self.max_worker_threads == 0 {
            return Err(CacheError::ResourceExhausted(format!(
                "worker pool bounds invalid: min {} max {}",
                self.min_worker_threads, self.max_worker_threads
            )));
        }
        Ok(())
    }

    /// Small pools and short, deterministic delays for unit tests.
    pub fn for_testing() -> Self {
        Self {
            view_count: 8,
            dirty_page_threshold: 64,
            dirty_page_target: 32,
            idle_delay: Duration::from_millis(20),
            first_delay: Duration::from_millis(10),
            collision_delay: Duration::from_millis(5),
            worker_idle_timeout: Duration::from_millis(50),
            max_worker_threads: 2,
            ..Self::default()
        }
    }

    /// Pages per view window.
    #[inline]
    pub fn pages_per_view(&self) -> usize {
        (self.view_granularity / self.page_size as u64) as usize
    }
}

// =============================================================================
// Tests
// =============================================================================
