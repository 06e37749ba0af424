use super::local::LocalRateLimiter;
use super::sliding::SlidingWindowLimiter;
use super::types::{CallerInfo, RateLimitDecision, RateLimitPolicy};
use crate::clock::{self, Clock};
use crate::error::{AdmissionError, Result};
use crate::metrics;
use crate::store::{DisabledStore, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Admission facade: picks the distributed limiter while the shared store
/// answers and the local fallback when it does not.
///
/// Store failures are never turned into an allow or a deny directly; the
/// request is re-evaluated against the local window instead.
#[derive(Debug, Clone)]
pub struct AdmissionService {
    store: Arc<dyn Store>,
    /// Shared-store rolling window
    distributed: SlidingWindowLimiter,
    /// In-process fixed window
    local: LocalRateLimiter,
    clock: Arc<dyn Clock>,
    /// Prefix for window keys
    key_prefix: String,
}

impl AdmissionService {
    /// Create an admission service over `store`
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
    ) -> Self {
        if store.is_enabled() {
            info!(
                backend = store.backend(),
                "Initializing distributed rate limiter with local fallback"
            );
        } else {
            info!("Initializing local-only rate limiter");
        }

        Self {
            distributed: SlidingWindowLimiter::new(store.clone(), clock.clone()),
            local: LocalRateLimiter::new(clock.clone()),
            store,
            clock,
            key_prefix: key_prefix.into(),
        }
    }

    /// Create a service with local-only rate limiting
    pub fn local_only() -> Self {
        Self::new(
            Arc::new(DisabledStore::default()),
            clock::system(),
            "admission:ratelimit",
        )
    }

    /// Full store key for a caller under a policy
    pub fn window_key(&self, policy: &RateLimitPolicy, caller_key: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, policy.name(), caller_key)
    }

    /// Compute the admission decision for `caller_key`
    pub async fn check(&self, policy: &RateLimitPolicy, caller_key: &str) -> RateLimitDecision {
        let key = self.window_key(policy, caller_key);

        let decision = if self.store.is_enabled() {
            match self.distributed.check_rate_limit(policy, &key).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        policy = policy.name(),
                        backend = self.store.backend(),
                        error = %e,
                        "Distributed rate limit check failed, using local fallback"
                    );
                    metrics::record_store_fallback(policy.name(), &e);
                    self.local.check_rate_limit(policy, &key)
                }
            }
        } else {
            self.local.check_rate_limit(policy, &key)
        };

        metrics::record_decision(policy.name(), decision.source.as_str(), decision.allowed);
        decision
    }

    /// Admit a caller or produce the denial signal.
    ///
    /// The decision is returned either way so rate-limit headers can be
    /// attached; on denial it is carried inside [`AdmissionError::RateLimited`].
    pub async fn admit(
        &self,
        policy: &RateLimitPolicy,
        caller: &CallerInfo,
    ) -> Result<RateLimitDecision> {
        let caller_key = policy.key_for(caller);
        let decision = self.check(policy, &caller_key).await;

        if decision.allowed {
            debug!(
                policy = policy.name(),
                remaining = decision.remaining,
                "Rate limit check passed"
            );
            return Ok(decision);
        }

        let retry_after_secs = decision.retry_after_secs(self.clock.now_millis());
        warn!(
            policy = policy.name(),
            key = %caller_key,
            retry_after_secs = retry_after_secs,
            "Rate limit exceeded"
        );

        Err(AdmissionError::RateLimited {
            message: policy.message().to_string(),
            limit: decision.limit,
            reset_at: decision.reset_at,
            retry_after_secs,
        })
    }

    /// Check whether the shared store is configured
    pub fn is_distributed(&self) -> bool {
        self.store.is_enabled()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The local fallback limiter
    pub fn local(&self) -> &LocalRateLimiter {
        &self.local
    }
}
