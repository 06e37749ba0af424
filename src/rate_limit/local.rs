use super::types::{DecisionSource, RateLimitDecision, RateLimitPolicy};
use crate::clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed-window counter for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCounter {
    pub count: u32,
    /// Window end in ms since epoch
    pub window_reset_at: u64,
}

/// Local (in-memory) rate limiter using a fixed window per key.
///
/// This is the safety net when the shared store cannot be reached. It never
/// fails and is never shared across instances. A burst straddling a window
/// boundary can see up to twice the quota.
#[derive(Debug, Clone)]
pub struct LocalRateLimiter {
    /// Counter per key
    counters: Arc<DashMap<String, LocalCounter>>,
    clock: Arc<dyn Clock>,
}

impl LocalRateLimiter {
    /// Create a new local rate limiter
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Check if a request is allowed
    pub fn check_rate_limit(&self, policy: &RateLimitPolicy, key: &str) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let limit = policy.max_requests();

        // The entry guard holds the shard lock, so read-modify-write is atomic
        let mut counter = self.counters.entry(key.to_string()).or_insert(LocalCounter {
            count: 0,
            window_reset_at: 0,
        });

        if counter.count == 0 || now >= counter.window_reset_at {
            counter.count = 1;
            counter.window_reset_at = now + policy.window_ms();
            debug!(key = key, "Started new local window");
            return RateLimitDecision::allowed(
                limit,
                limit - 1,
                counter.window_reset_at,
                DecisionSource::Local,
            );
        }

        if counter.count < limit {
            counter.count += 1;
            return RateLimitDecision::allowed(
                limit,
                limit - counter.count,
                counter.window_reset_at,
                DecisionSource::Local,
            );
        }

        warn!(key = key, "Rate limit exceeded (local window)");
        RateLimitDecision::denied(limit, counter.window_reset_at, DecisionSource::Local)
    }

    /// Drop counters whose window has ended; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.window_reset_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Current counter for a key
    pub fn counter(&self, key: &str) -> Option<LocalCounter> {
        self.counters.get(key).map(|c| *c)
    }

    /// Get the number of tracked keys (for testing/monitoring)
    pub fn active_keys(&self) -> usize {
        self.counters.len()
    }

    /// Clear all counters
    pub fn clear(&self) {
        self.counters.clear();
    }
}
