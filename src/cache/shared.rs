use super::{CacheEntry, CacheStats};
use crate::clock::{self, Clock};
use crate::error::Result;
use crate::metrics;
use crate::store::Store;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TTL cache kept in the shared store.
///
/// Entries are stored as JSON under `{namespace}:{key}` with a store-side
/// expiry equal to their TTL. The store being unreachable or holding an
/// unreadable value both read as a miss; writes that fail are logged and
/// dropped.
#[derive(Clone)]
pub struct SharedCache {
    store: Arc<dyn Store>,
    namespace: String,
    clock: Arc<dyn Clock>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache")
            .field("backend", &self.store.backend())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl SharedCache {
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>) -> Self {
        Self::with_clock(store, namespace, clock::system())
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            clock,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Get a live value
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(&self.store_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(namespace = %self.namespace, key = key, error = %e, "Shared cache read failed");
                None
            }
        };

        let now = self.clock.now_millis();
        let live = raw.and_then(|raw| match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) if !entry.is_expired(now) => Some(entry.value),
            Ok(_) => None,
            Err(e) => {
                warn!(namespace = %self.namespace, key = key, error = %e, "Discarding unreadable cache entry");
                None
            }
        });

        if live.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(&self.namespace, live.is_some());
        live
    }

    /// Return the cached value, or run `compute` and cache its result.
    ///
    /// Compute errors are returned unchanged and nothing is written.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Store a value; failures are logged, not returned
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let entry = CacheEntry::new(value, self.clock.now_millis(), ttl);
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(namespace = %self.namespace, key = key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        match self.store.set(&self.store_key(key), &raw, Some(ttl)).await {
            Ok(()) => debug!(namespace = %self.namespace, key = key, "Cached value in shared store"),
            Err(e) => {
                warn!(namespace = %self.namespace, key = key, error = %e, "Shared cache write failed")
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.del(&self.store_key(key)).await {
            warn!(namespace = %self.namespace, key = key, error = %e, "Shared cache delete failed");
        }
    }

    /// Invalidate every key (without namespace) matching `pattern`.
    ///
    /// Only an invalid pattern is an error; an unreachable store removes
    /// nothing and returns 0.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = Regex::new(pattern)?;
        let prefix = format!("{}:", self.namespace);

        let keys = match self.store.keys(&format!("{}*", prefix)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(namespace = %self.namespace, pattern = pattern, error = %e, "Shared cache scan failed");
                return Ok(0);
            }
        };

        let mut removed = 0;
        for full_key in keys {
            let Some(key) = full_key.strip_prefix(&prefix) else {
                continue;
            };
            if !matcher.is_match(key) {
                continue;
            }
            match self.store.del(&full_key).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(namespace = %self.namespace, key = key, error = %e, "Shared cache delete failed")
                }
            }
        }

        debug!(namespace = %self.namespace, pattern = pattern, removed = removed, "Invalidated shared cache entries");
        Ok(removed)
    }

    /// Remove every entry in the namespace
    pub async fn clear(&self) -> usize {
        // An empty regex matches every key
        self.invalidate_pattern("").await.unwrap_or(0)
    }

    /// Lookup statistics for this handle. The entry count is not tracked
    /// for the shared store and is always 0.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: 0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
