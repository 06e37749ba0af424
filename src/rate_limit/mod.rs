//! Rate limiting module
//!
//! Request admission in two layers:
//!
//! - **Sliding Window** (distributed): a rolling window per key kept in the
//!   shared store and updated atomically, so every instance agrees
//! - **Fixed Window** (local): an in-process counter used whenever the shared
//!   store cannot be reached
//!
//! # Features
//!
//! - Predefined policy classes (generation, search, mutation, read-only,
//!   auth, export) with config overrides
//! - Keys by IP, user, API key or a custom function
//! - Fail-closed fallback from the shared store to the local limiter
//! - Rate limit headers in responses (`X-RateLimit-*`, `Retry-After`)
//!
//! # Example
//!
//! ```rust,no_run
//! use admission::rate_limit::{AdmissionService, PolicyClass, RateLimitPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Local-only admission (no shared store configured)
//!     let service = AdmissionService::local_only();
//!     let policy = RateLimitPolicy::for_class(PolicyClass::Generation);
//!
//!     let decision = service.check(&policy, "ip:203.0.113.7").await;
//!     assert!(decision.allowed);
//! }
//! ```

pub mod local;
pub mod middleware;
pub mod policy;
pub mod service;
pub mod sliding;
pub mod types;

// Re-export commonly used types
pub use local::LocalRateLimiter;
pub use middleware::{
    add_rate_limit_headers, caller_info, rate_limit_middleware, AuthenticatedUser, PolicyGuard,
};
pub use policy::PolicySet;
pub use service::AdmissionService;
pub use sliding::SlidingWindowLimiter;
pub use types::{
    CallerInfo, DecisionSource, PolicyClass, RateLimitConfig, RateLimitDecision,
    RateLimitDimension, RateLimitPolicy,
};
