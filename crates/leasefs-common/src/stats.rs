//! Lock-free statistics for the client cache.
//!
//! Counters are `AtomicU64` with relaxed ordering: cheap to bump on every
//! call, eventually consistent when read. [`ClientStats::snapshot`] turns
//! them into a serializable value.
//!
//! # Usage
//!
//! ```
//! use leasefs_common::ClientStats;
//!
//! let stats = ClientStats::new();
//! stats.record_read(4096);
//! stats.record_write(512);
//! stats.record_error();
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.bytes_read, 4096);
//! assert_eq!(snap.ops, 2);
//! assert_eq!(snap.errors, 1);
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Hit/miss counters of one cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    entries: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit.
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss.
    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry entering the cache.
    #[inline]
    pub fn record_insert(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry leaving the cache.
    #[inline]
    pub fn record_remove(&self) {
        let _ = self
            .entries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Record an eviction.
    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits so far.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Misses so far.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Current entry count.
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Evictions so far.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Copy of the current values.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hit_count(),
            misses: self.miss_count(),
            entries: self.entry_count(),
            evictions: self.eviction_count(),
        }
    }
}

/// Serializable copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Hits.
    pub hits: u64,
    /// Misses.
    pub misses: u64,
    /// Entries.
    pub entries: u64,
    /// Evictions.
    pub evictions: u64,
}

impl CacheStatsSnapshot {
    /// Hit fraction in `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Statistics of one mounted client.
#[derive(Debug)]
pub struct ClientStats {
    // === Operation Counts ===
    ops: AtomicU64,
    errors: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    metadata_ops: AtomicU64,

    // === Bytes ===
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    // === Background Flush ===
    flush_retries: AtomicU64,
    flush_failures: AtomicU64,

    // === Handles ===
    open_files: AtomicU64,
    open_dirs: AtomicU64,

    // === Caches ===
    md_cache: Arc<CacheStats>,
    cap_cache: Arc<CacheStats>,

    // === Activity ===
    last_activity: RwLock<Instant>,
    session_start: SystemTime,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    /// Zeroed statistics with the session starting now.
    pub fn new() -> Self {
        Self {
            ops: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            metadata_ops: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            open_files: AtomicU64::new(0),
            open_dirs: AtomicU64::new(0),
            md_cache: Arc::new(CacheStats::new()),
            cap_cache: Arc::new(CacheStats::new()),
            last_activity: RwLock::new(Instant::now()),
            session_start: SystemTime::now(),
        }
    }

    // === Recording Methods ===

    /// Record a data read.
    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.record_op();
    }

    /// Record a data write.
    #[inline]
    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.record_op();
    }

    /// Record a metadata operation.
    #[inline]
    pub fn record_metadata_op(&self) {
        self.metadata_ops.fetch_add(1, Ordering::Relaxed);
        self.record_op();
    }

    /// Record any operation.
    #[inline]
    pub fn record_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.write() = Instant::now();
    }

    /// Record an operation that returned an error.
    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background flush retry.
    #[inline]
    pub fn record_flush_retry(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background mutation that failed permanently.
    #[inline]
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file being opened.
    #[inline]
    pub fn record_file_open(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file being released.
    #[inline]
    pub fn record_file_close(&self) {
        saturating_dec(&self.open_files);
    }

    /// Record a directory being opened.
    #[inline]
    pub fn record_dir_open(&self) {
        self.open_dirs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a directory being released.
    #[inline]
    pub fn record_dir_close(&self) {
        saturating_dec(&self.open_dirs);
    }

    // === Query Methods ===

    /// Metadata cache counters, shared with the cache itself.
    pub fn md_cache_stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.md_cache)
    }

    /// Capability cache counters, shared with the cache itself.
    pub fn cap_cache_stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.cap_cache)
    }

    /// Currently open files.
    pub fn open_files(&self) -> u64 {
        self.open_files.load(Ordering::Relaxed)
    }

    /// Currently open directories.
    pub fn open_dirs(&self) -> u64 {
        self.open_dirs.load(Ordering::Relaxed)
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            metadata_ops: self.metadata_ops.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            open_files: self.open_files(),
            open_dirs: self.open_dirs(),
            md_cache: self.md_cache.snapshot(),
            cap_cache: self.cap_cache.snapshot(),
            session_start: self.session_start,
            idle: self.last_activity.read().elapsed(),
        }
    }
}

fn saturating_dec(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
}

/// Serializable copy of [`ClientStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatsSnapshot {
    /// All operations.
    pub ops: u64,
    /// Operations that returned an error.
    pub errors: u64,
    /// Data reads.
    pub reads: u64,
    /// Data writes.
    pub writes: u64,
    /// Metadata operations.
    pub metadata_ops: u64,
    /// Bytes returned by reads.
    pub bytes_read: u64,
    /// Bytes accepted by writes.
    pub bytes_written: u64,
    /// Background flush retries.
    pub flush_retries: u64,
    /// Background mutations that failed permanently.
    pub flush_failures: u64,
    /// Open files.
    pub open_files: u64,
    /// Open directories.
    pub open_dirs: u64,
    /// Metadata cache counters.
    pub md_cache: CacheStatsSnapshot,
    /// Capability cache counters.
    pub cap_cache: CacheStatsSnapshot,
    /// When the session started.
    #[serde(with = "humantime_serde")]
    pub session_start: SystemTime,
    /// Time since the last operation.
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_rate() {
        let stats = CacheStats::new();
        assert!(stats.snapshot().hit_rate().abs() < f64::EPSILON);
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_saturates() {
        let stats = CacheStats::new();
        stats.record_remove();
        assert_eq!(stats.entry_count(), 0);
        stats.record_insert();
        stats.record_remove();
        assert_eq!(stats.entry_count(), 0);
    }

    #[test]
    fn test_client_counters() {
        let stats = ClientStats::new();
        stats.record_read(100);
        stats.record_write(50);
        stats.record_metadata_op();
        stats.record_file_open();
        stats.record_file_close();
        stats.record_file_close();
        stats.record_dir_open();

        let snap = stats.snapshot();
        assert_eq!(snap.ops, 3);
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.metadata_ops, 1);
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.bytes_written, 50);
        assert_eq!(snap.open_files, 0);
        assert_eq!(snap.open_dirs, 1);
        assert!(snap.idle < Duration::from_secs(5));
    }

    #[test]
    fn test_shared_cache_stats() {
        let stats = ClientStats::new();
        stats.md_cache_stats().record_hit();
        stats.cap_cache_stats().record_miss();
        let snap = stats.snapshot();
        assert_eq!(snap.md_cache.hits, 1);
        assert_eq!(snap.cap_cache.misses, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ClientStats::new();
        stats.record_read(1);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"bytes_read\":1"));
        let back: ClientStatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes_read, 1);
    }
}
