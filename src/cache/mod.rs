//! TTL caches for memoizing expensive lookups
//!
//! - [`TtlCache`]: in-process cache with a TTL per entry and pattern
//!   invalidation. Expired entries are invisible on read and physically
//!   removed by [`TtlCache::sweep`].
//! - [`SharedCache`]: the same contract on top of the shared store, for
//!   values that should survive across instances. Any store failure reads
//!   as a miss.
//!
//! Neither cache deduplicates concurrent misses: two callers missing the
//! same key at once both run their compute function.

pub mod local;
pub mod shared;

pub use local::TtlCache;
pub use shared::SharedCache;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value with the time it was written and how long it lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Write time in ms since epoch
    pub written_at: u64,
    /// Lifetime in ms
    pub ttl_ms: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, written_at: u64, ttl: Duration) -> Self {
        Self {
            value,
            written_at,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// An entry is logically gone once its TTL has fully elapsed
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.written_at) >= self.ttl_ms
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Build a key following the `prefix:entityId:field` convention, so that
/// everything about one entity can be invalidated with `^prefix:entityId:`.
pub fn entity_key(prefix: &str, entity_id: &str, field: &str) -> String {
    format!("{}:{}:{}", prefix, entity_id, field)
}
