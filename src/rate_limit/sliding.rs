use super::types::{DecisionSource, RateLimitDecision, RateLimitPolicy};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::store::{Store, WindowRequest};
use std::sync::Arc;
use tracing::{debug, warn};

/// Distributed rate limiter using a rolling window in the shared store.
///
/// Each check runs the store's atomic trim/count/record/expire step, so every
/// instance sharing the store sees the same window for a key. The first
/// `max_requests` requests inside any trailing window are admitted.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("store", &self.store.backend())
            .finish()
    }
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Evaluate one request against the window for `key`.
    ///
    /// Errors mean no decision could be made; the caller must fall back
    /// rather than allow or deny on its own.
    pub async fn check_rate_limit(
        &self,
        policy: &RateLimitPolicy,
        key: &str,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now_millis();
        let limit = policy.max_requests();
        let window_ms = policy.window_ms();

        let request = WindowRequest::new(now, window_ms, limit);
        let hit = self.store.record_hit(key, &request).await?;

        let allowed = hit.count < limit as u64;
        if allowed != hit.recorded {
            return Err(AdmissionError::MalformedReply(format!(
                "window for {} reported count {} but recorded={}",
                key, hit.count, hit.recorded
            )));
        }

        debug!(
            key = key,
            count = hit.count,
            allowed = allowed,
            "Sliding window check"
        );

        if allowed {
            let remaining = (limit as u64).saturating_sub(hit.count + 1) as u32;
            Ok(RateLimitDecision::allowed(
                limit,
                remaining,
                now + window_ms,
                DecisionSource::Distributed,
            ))
        } else {
            // Entries at exactly the window start still count, so the oldest
            // one leaves the window 1ms after `oldest + window`
            let reset_at = match hit.oldest_ms {
                Some(oldest) => (oldest + window_ms + 1).max(now + 1),
                None => now + window_ms,
            };

            warn!(key = key, "Rate limit exceeded (sliding window)");
            Ok(RateLimitDecision::denied(
                limit,
                reset_at,
                DecisionSource::Distributed,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{DisabledStore, MemoryStore, WindowHit};
    use async_trait::async_trait;
    use std::time::Duration;

    fn limiter(clock: &ManualClock) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_admits_exactly_max_requests() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter(&clock);
        let policy = RateLimitPolicy::new("test", 5, 60).unwrap();

        for i in 0..5u32 {
            let decision = limiter.check_rate_limit(&policy, "k").await.unwrap();
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.reset_at, 1_060_000);
            assert_eq!(decision.source, DecisionSource::Distributed);
        }

        let decision = limiter.check_rate_limit(&policy, "k").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_window_rolls_instead_of_resetting() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let policy = RateLimitPolicy::new("test", 2, 10).unwrap();

        // t=0 and t=9s fill the window
        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
        clock.set(9_000);
        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);

        // A fixed window would reset at t=10s; the rolling one frees a single
        // slot once t=0 leaves the window
        clock.set(10_001);
        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
        let denied = limiter.check_rate_limit(&policy, "k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, 19_001);
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_extend_the_window() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let policy = RateLimitPolicy::new("test", 1, 1).unwrap();

        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
        for step in 1..5 {
            clock.set(step * 200);
            assert!(!limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
        }

        clock.advance(Duration::from_millis(201));
        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_at_window_edge_points_at_next_millisecond() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let policy = RateLimitPolicy::new("test", 1, 60).unwrap();

        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);

        // The t=0 entry sits exactly on the window start and still counts
        clock.set(60_000);
        let denied = limiter.check_rate_limit(&policy, "k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, 60_001);
        assert_eq!(denied.retry_after_secs(60_000), 1);

        clock.set(denied.reset_at);
        assert!(limiter.check_rate_limit(&policy, "k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let clock = ManualClock::new(0);
        let limiter =
            SlidingWindowLimiter::new(Arc::new(DisabledStore::default()), Arc::new(clock));
        let policy = RateLimitPolicy::new("test", 1, 1).unwrap();

        let result = limiter.check_rate_limit(&policy, "k").await;
        assert!(matches!(result, Err(AdmissionError::StoreUnavailable(_))));
    }

    #[derive(Debug)]
    struct InconsistentStore;

    #[async_trait]
    impl Store for InconsistentStore {
        fn backend(&self) -> &'static str {
            "inconsistent"
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            Ok(())
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn record_hit(&self, _key: &str, _request: &WindowRequest) -> Result<WindowHit> {
            // Claims the request was recorded although the window is full
            Ok(WindowHit {
                count: 10,
                recorded: true,
                oldest_ms: None,
            })
        }
    }

    #[tokio::test]
    async fn test_inconsistent_reply_is_not_guessed() {
        let limiter = SlidingWindowLimiter::new(
            Arc::new(InconsistentStore),
            Arc::new(ManualClock::new(0)),
        );
        let policy = RateLimitPolicy::new("test", 3, 60).unwrap();

        let result = limiter.check_rate_limit(&policy, "k").await;
        assert!(matches!(result, Err(AdmissionError::MalformedReply(_))));
    }
}
