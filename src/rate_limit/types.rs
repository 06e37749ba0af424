use crate::error::{AdmissionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Rate limit dimension - what to rate limit by
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDimension {
    /// Rate limit by client network address
    #[default]
    Ip,
    /// Rate limit by authenticated user, falling back to the address
    User,
    /// Rate limit by API key, falling back to the address
    ApiKey,
}

/// Predefined classes of protected operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    /// Expensive LLM generation
    Generation,
    Search,
    Mutation,
    ReadOnly,
    /// Sign-in and credential endpoints
    Auth,
    Export,
}

impl PolicyClass {
    pub const ALL: [PolicyClass; 6] = [
        PolicyClass::Generation,
        PolicyClass::Search,
        PolicyClass::Mutation,
        PolicyClass::ReadOnly,
        PolicyClass::Auth,
        PolicyClass::Export,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PolicyClass::Generation => "generation",
            PolicyClass::Search => "search",
            PolicyClass::Mutation => "mutation",
            PolicyClass::ReadOnly => "read_only",
            PolicyClass::Auth => "auth",
            PolicyClass::Export => "export",
        }
    }

    /// Default quota for this class
    pub fn default_config(&self) -> RateLimitConfig {
        let (requests, window_secs, message) = match self {
            PolicyClass::Generation => (
                10,
                60,
                "Too many generation requests. Please wait before generating more content.",
            ),
            PolicyClass::Search => (30, 60, "Too many search requests. Please slow down."),
            PolicyClass::Mutation => (60, 60, "Too many requests. Please slow down."),
            PolicyClass::ReadOnly => (120, 60, "Too many requests. Please slow down."),
            PolicyClass::Auth => (
                5,
                300,
                "Too many authentication attempts. Please try again later.",
            ),
            PolicyClass::Export => (30, 60, "Too many export requests. Please slow down."),
        };

        RateLimitConfig {
            dimension: RateLimitDimension::Ip,
            requests,
            window_secs,
            message: Some(message.to_string()),
        }
    }
}

/// Rate limit configuration as it appears in config files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Dimension to rate limit by
    #[serde(default)]
    pub dimension: RateLimitDimension,
    /// Maximum number of requests allowed
    pub requests: u32,
    /// Time window for the limit (in seconds)
    pub window_secs: u64,
    /// Message returned on denial
    #[serde(default)]
    pub message: Option<String>,
}

impl RateLimitConfig {
    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Build a validated policy named `name`
    pub fn into_policy(self, name: &str) -> Result<RateLimitPolicy> {
        let policy = RateLimitPolicy::new(name, self.requests, self.window_secs)?
            .with_dimension(self.dimension);

        Ok(match self.message {
            Some(message) => policy.with_message(message),
            None => policy,
        })
    }
}

/// Identity of the caller presenting a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

impl CallerInfo {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Key derived from the network address
    pub fn ip_key(&self) -> String {
        match self.ip {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        }
    }
}

/// Custom caller-to-key mapping
pub type KeyFn = Arc<dyn Fn(&CallerInfo) -> String + Send + Sync>;

/// An immutable admission policy: quota, window, key derivation and the
/// message shown on denial.
#[derive(Clone)]
pub struct RateLimitPolicy {
    name: String,
    max_requests: u32,
    window_secs: u64,
    message: String,
    dimension: RateLimitDimension,
    key_fn: Option<KeyFn>,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("window_secs", &self.window_secs)
            .field("dimension", &self.dimension)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RateLimitPolicy {
    /// Create a policy. Non-positive quota or window is rejected here so a
    /// misconfigured policy can never reach request handling.
    pub fn new(name: impl Into<String>, max_requests: u32, window_secs: u64) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(AdmissionError::Config(
                "Rate limit policy name cannot be empty".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(AdmissionError::Config(format!(
                "Rate limit requests must be > 0 for policy: {}",
                name
            )));
        }
        if window_secs == 0 {
            return Err(AdmissionError::Config(format!(
                "Rate limit window must be > 0 for policy: {}",
                name
            )));
        }

        Ok(Self {
            name,
            max_requests,
            window_secs,
            message: "Too many requests. Please try again later.".to_string(),
            dimension: RateLimitDimension::Ip,
            key_fn: None,
        })
    }

    /// Policy for a predefined class with its default quota
    pub fn for_class(class: PolicyClass) -> Self {
        let config = class.default_config();
        Self {
            name: class.name().to_string(),
            max_requests: config.requests,
            window_secs: config.window_secs,
            message: config.message.unwrap_or_default(),
            dimension: config.dimension,
            key_fn: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_dimension(mut self, dimension: RateLimitDimension) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&CallerInfo) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn dimension(&self) -> RateLimitDimension {
        self.dimension
    }

    /// Derive the caller key for this policy
    pub fn key_for(&self, caller: &CallerInfo) -> String {
        if let Some(key_fn) = &self.key_fn {
            return key_fn(caller);
        }

        match self.dimension {
            RateLimitDimension::Ip => caller.ip_key(),
            RateLimitDimension::User => caller
                .user_id
                .as_ref()
                .map(|id| format!("user:{}", id))
                .unwrap_or_else(|| caller.ip_key()),
            RateLimitDimension::ApiKey => caller
                .api_key
                .as_ref()
                .map(|key| format!("apikey:{}", key))
                .unwrap_or_else(|| caller.ip_key()),
        }
    }
}

/// Which limiter produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Shared-store sliding window
    Distributed,
    /// Process-local fixed window
    Local,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Distributed => "distributed",
            DecisionSource::Local => "local",
        }
    }
}

/// Admission decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Total limit
    pub limit: u32,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// When the limit resets (ms since epoch)
    pub reset_at: u64,
    /// Limiter that produced the decision
    pub source: DecisionSource,
}

impl RateLimitDecision {
    /// Create an allowed decision
    pub fn allowed(limit: u32, remaining: u32, reset_at: u64, source: DecisionSource) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            source,
        }
    }

    /// Create a denied decision
    pub fn denied(limit: u32, reset_at: u64, source: DecisionSource) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            source,
        }
    }

    /// Seconds until `reset_at`, rounded up
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms).div_ceil(1000)
    }
}
