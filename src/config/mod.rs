use crate::error::{AdmissionError, Result};
use crate::rate_limit::types::{PolicyClass, RateLimitConfig};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Secret string wrapper that prevents accidental exposure
pub type SecretString = Secret<String>;

/// Environment variable holding the shared store URL
pub const STORE_URL_ENV: &str = "ADMISSION_STORE_URL";
/// Environment variable holding the shared store token
pub const STORE_TOKEN_ENV: &str = "ADMISSION_STORE_TOKEN";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which store backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Pick from the URL scheme (`redis://`, `rediss://`, `http(s)://`)
    #[default]
    Auto,
    Rest,
    Redis,
    Memory,
    Disabled,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub kind: StoreKind,
    /// Connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Access token, only ever read from the environment
    #[serde(skip)]
    pub token: Option<SecretString>,
    /// Bound on every store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-process cache
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// TTL used when callers do not pass one, in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Interval of the background sweep in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Key namespace for entries kept in the shared store
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix for window keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Overrides for the predefined policy classes
    #[serde(default)]
    pub policies: HashMap<PolicyClass, RateLimitConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_store_timeout_ms() -> u64 {
    1000
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_cache_namespace() -> String {
    "admission:cache".to_string()
}

fn default_key_prefix() -> String {
    "admission:ratelimit".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Auto,
            url: None,
            token: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            namespace: default_cache_namespace(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            policies: HashMap::new(),
        }
    }
}

impl StoreConfig {
    /// Store call timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backend implied by the URL scheme; `Auto` when there is no URL
    pub fn detect_kind(&self) -> StoreKind {
        let Some(raw) = self.url.as_deref() else {
            return StoreKind::Auto;
        };

        match url::Url::parse(raw).map(|u| u.scheme().to_string()) {
            Ok(scheme) if scheme == "redis" || scheme == "rediss" => StoreKind::Redis,
            Ok(scheme) if scheme == "http" || scheme == "https" => StoreKind::Rest,
            _ => StoreKind::Auto,
        }
    }

    /// Configured backend, with `Auto` resolved from the URL
    pub fn resolved_kind(&self) -> StoreKind {
        match self.kind {
            StoreKind::Auto => self.detect_kind(),
            other => other,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdmissionError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Fill store credentials from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Fill store credentials from `lookup`; empty values count as absent
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(STORE_URL_ENV) {
            debug!("Store URL taken from {}", STORE_URL_ENV);
            self.store.url = Some(url);
        }
        if let Some(token) = non_empty(STORE_TOKEN_ENV) {
            debug!("Store token taken from {}", STORE_TOKEN_ENV);
            self.store.token = Some(Secret::new(token));
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "Store timeout must be > 0".to_string(),
            ));
        }

        if let Some(raw) = &self.store.url {
            url::Url::parse(raw).map_err(|e| {
                AdmissionError::Config(format!("Invalid store URL '{}': {}", raw, e))
            })?;
        }

        if self.cache.sweep_interval_secs == 0 {
            return Err(AdmissionError::Config(
                "Cache sweep interval must be > 0".to_string(),
            ));
        }

        if self.cache.default_ttl_secs == 0 {
            return Err(AdmissionError::Config(
                "Cache default TTL must be > 0".to_string(),
            ));
        }

        for (class, limit) in &self.rate_limiting.policies {
            if limit.requests == 0 {
                return Err(AdmissionError::Config(format!(
                    "Rate limit requests must be > 0 for policy: {}",
                    class.name()
                )));
            }
            if limit.window_secs == 0 {
                return Err(AdmissionError::Config(format!(
                    "Rate limit window must be > 0 for policy: {}",
                    class.name()
                )));
            }
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::RateLimitDimension;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9090

store:
  url: "https://kv.example.com"
  timeout_ms: 250

cache:
  max_capacity: 500
  sweep_interval_secs: 30

rate_limiting:
  key_prefix: "app:rl"
  policies:
    generation:
      requests: 20
      window_secs: 60
      message: "Generation quota exceeded"
    auth:
      dimension: ip
      requests: 3
      window_secs: 600
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.store.detect_kind(), StoreKind::Rest);
        assert_eq!(config.cache.max_capacity, 500);
        assert_eq!(config.rate_limiting.key_prefix, "app:rl");

        let generation = &config.rate_limiting.policies[&PolicyClass::Generation];
        assert_eq!(generation.requests, 20);
        assert_eq!(
            generation.message.as_deref(),
            Some("Generation quota exceeded")
        );
        assert_eq!(
            config.rate_limiting.policies[&PolicyClass::Auth].dimension,
            RateLimitDimension::Ip
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.kind, StoreKind::Auto);
        assert!(config.store.url.is_none());
        assert_eq!(config.store.timeout_ms, 1000);
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.rate_limiting.key_prefix, "admission:ratelimit");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_detect_kind_from_scheme() {
        let mut store = StoreConfig::default();
        assert_eq!(store.detect_kind(), StoreKind::Auto);

        store.url = Some("redis://127.0.0.1:6379".to_string());
        assert_eq!(store.detect_kind(), StoreKind::Redis);

        store.url = Some("rediss://cache.internal:6380".to_string());
        assert_eq!(store.detect_kind(), StoreKind::Redis);

        store.url = Some("https://kv.example.com".to_string());
        assert_eq!(store.detect_kind(), StoreKind::Rest);
    }

    #[test]
    fn test_resolved_kind_prefers_explicit_kind() {
        let mut store = StoreConfig {
            url: Some("redis://127.0.0.1:6379".to_string()),
            ..StoreConfig::default()
        };
        assert_eq!(store.resolved_kind(), StoreKind::Redis);

        store.kind = StoreKind::Memory;
        assert_eq!(store.resolved_kind(), StoreKind::Memory);
    }

    #[test]
    fn test_apply_env_sets_credentials() {
        let mut config = AppConfig::default();
        config.apply_env_from(|name| match name {
            STORE_URL_ENV => Some("https://kv.example.com".to_string()),
            STORE_TOKEN_ENV => Some("token-123".to_string()),
            _ => None,
        });

        assert_eq!(config.store.url.as_deref(), Some("https://kv.example.com"));
        assert_eq!(
            config.store.token.as_ref().unwrap().expose_secret(),
            "token-123"
        );
    }

    #[test]
    fn test_apply_env_ignores_empty_values() {
        let mut config = AppConfig::default();
        config.apply_env_from(|_| Some("  ".to_string()));

        assert!(config.store.url.is_none());
        assert!(config.store.token.is_none());
    }

    #[test]
    fn test_validate_zero_requests() {
        let yaml = r#"
rate_limiting:
  policies:
    search:
      requests: 0
      window_secs: 60
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_window() {
        let yaml = r#"
rate_limiting:
  policies:
    export:
      requests: 5
      window_secs: 0
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_store_url() {
        let mut config = AppConfig::default();
        config.store.url = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 7070").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7070);
    }

    #[test]
    fn test_from_missing_file() {
        let result = AppConfig::from_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(AdmissionError::Config(_))));
    }
}
