use super::{CacheEntry, CacheStats};
use crate::clock::{self, Clock};
use crate::error::Result;
use crate::metrics;
use moka::future::Cache;
use moka::Expiry;
use regex::Regex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Expiry policy reading each entry's own TTL
struct EntryExpiry;

impl<T> Expiry<String, CacheEntry<T>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<T>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<T>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // An overwrite starts a fresh lifetime
        Some(value.ttl())
    }
}

/// In-process TTL cache.
///
/// Reads check the entry's logical expiry against the clock, so an expired
/// entry is a miss even before it is physically evicted.
#[derive(Clone)]
pub struct TtlCache<T> {
    name: String,
    cache: Cache<String, CacheEntry<T>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<T> std::fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("entry_count", &self.cache.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<T> TtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cache
    pub fn new(name: impl Into<String>, max_capacity: u64, default_ttl: Duration) -> Self {
        Self::with_clock(name, max_capacity, default_ttl, clock::system())
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(
        name: impl Into<String>,
        max_capacity: u64,
        default_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        info!(
            cache = %name,
            max_capacity = max_capacity,
            default_ttl_secs = default_ttl.as_secs(),
            "Initialized TTL cache"
        );

        Self {
            name,
            cache,
            default_ttl,
            clock,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a live value
    pub async fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();
        let live = match self.cache.get(key).await {
            Some(entry) if !entry.is_expired(now) => Some(entry.value),
            _ => None,
        };

        if live.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = %self.name, key = key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(&self.name, live.is_some());
        live
    }

    /// Return the cached value, or run `compute` and cache its result.
    ///
    /// A failing `compute` leaves the cache untouched and its error is
    /// returned as is. Concurrent misses on one key each run `compute`.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Store a value, replacing any previous one
    pub async fn set(&self, key: &str, value: T, ttl: Duration) {
        let entry = CacheEntry::new(value, self.clock.now_millis(), ttl);
        self.cache.insert(key.to_string(), entry).await;
        debug!(cache = %self.name, key = key, ttl_ms = ttl.as_millis() as u64, "Cached value");
    }

    /// Store a value with the cache's default TTL
    pub async fn set_default(&self, key: &str, value: T) {
        self.set(key, value, self.default_ttl).await;
    }

    /// Invalidate cache entry
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
        debug!(cache = %self.name, key = key, "Invalidated cache entry");
    }

    /// Invalidate every key matching `pattern`; returns how many were removed
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = Regex::new(pattern)?;
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }

        debug!(
            cache = %self.name,
            pattern = pattern,
            removed = keys.len(),
            "Invalidated cache entries by pattern"
        );
        Ok(keys.len())
    }

    /// Clear all cache entries
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        info!(cache = %self.name, "Cleared all cache entries");
    }

    /// Physically remove expired entries; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let expired: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.cache.invalidate(key.as_str()).await;
        }
        self.cache.run_pending_tasks().await;

        expired.len()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        CacheStats {
            entry_count: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
