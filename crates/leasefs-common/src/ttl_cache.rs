//! TTL caches backed by Moka.
//!
//! Two shapes are provided:
//!
//! - [`TtlCache`] - positive entries with a fixed TTL, checked again on
//!   read (via Moka's `Expiry` trait)
//! - [`NegativeCache`] - "known not to exist" markers with a fixed TTL
//!
//! Both are thread-safe and bounded. Expired entries are never returned even
//! if Moka has not reclaimed them yet.
//!
//! # Tracing
//!
//! Enable the `cache-tracing` feature for debug events on every hit, miss
//! and insert.

use moka::Expiry;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[cfg(feature = "cache-tracing")]
macro_rules! cache_event {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!($($arg)*)
    };
}

#[cfg(not(feature = "cache-tracing"))]
macro_rules! cache_event {
    ($level:ident, $($arg:tt)*) => {};
}

/// Default time-to-live for positive entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default time-to-live for negative entries.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

const DEFAULT_MAX_CAPACITY: u64 = 50_000;
const DEFAULT_NEGATIVE_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    ttl: Duration,
    expires: Instant,
}

impl<V> CachedEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            ttl,
            expires: Instant::now() + ttl,
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }
}

struct PerEntryExpiry;

impl<K, V> Expiry<K, CachedEntry<V>> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &CachedEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CachedEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Thread-safe TTL cache.
///
/// # Example
///
/// ```
/// use leasefs_common::TtlCache;
/// use std::time::Duration;
///
/// let cache: TtlCache<u64, &str> = TtlCache::new(Duration::from_secs(5));
/// cache.insert(7, "denied");
/// assert_eq!(cache.get(&7), Some("denied"));
///
/// cache.clear();
/// assert_eq!(cache.get(&7), None);
/// ```
pub struct TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: moka::sync::Cache<K, CachedEntry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: moka::sync::Cache::builder()
                .max_capacity(DEFAULT_MAX_CAPACITY)
                .expire_after(PerEntryExpiry)
                .support_invalidation_closures()
                .build(),
            ttl,
        }
    }

    /// The live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.get(key) {
            Some(entry) if !entry.is_expired() => {
                cache_event!(debug, "ttl cache hit");
                Some(entry.value)
            }
            _ => {
                cache_event!(debug, "ttl cache miss");
                None
            }
        }
    }

    /// Inserts `value`; a zero TTL only removes any existing entry.
    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            self.inner.invalidate(&key);
            return;
        }
        self.inner.insert(key, CachedEntry::new(value, self.ttl));
        cache_event!(debug, ttl_ms = self.ttl.as_millis() as u64, "ttl cache insert");
    }

    /// Removes every entry whose key matches `predicate`.
    pub fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        if let Err(e) = self.inner.invalidate_entries_if(move |k, _| predicate(k)) {
            tracing::warn!(error = %e, "ttl cache predicate invalidation failed");
        }
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.inner.entry_count())
            .finish_non_exhaustive()
    }
}

/// Time-bounded "does not exist" markers.
///
/// A zero TTL disables the cache: inserts are dropped and every lookup
/// misses.
pub struct NegativeCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    inner: Option<moka::sync::Cache<K, Instant>>,
    ttl: Duration,
}

impl<K> NegativeCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// A negative cache whose markers live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        let inner = (!ttl.is_zero()).then(|| {
            moka::sync::Cache::builder()
                .max_capacity(DEFAULT_NEGATIVE_MAX_CAPACITY)
                .time_to_live(ttl)
                .build()
        });
        Self { inner, ttl }
    }

    /// Records `key` as absent.
    pub fn insert(&self, key: K) {
        if let Some(inner) = &self.inner {
            inner.insert(key, Instant::now() + self.ttl);
        }
    }

    /// True if `key` is known to be absent.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .as_ref()
            .and_then(|inner| inner.get(key))
            .is_some_and(|expires| Instant::now() < expires)
    }

    /// Drops the marker for `key`.
    pub fn remove(&self, key: &K) {
        if let Some(inner) = &self.inner {
            inner.invalidate(key);
        }
    }
}

impl<K> std::fmt::Debug for NegativeCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegativeCache")
            .field("ttl", &self.ttl)
            .field("enabled", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}
