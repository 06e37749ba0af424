//! Shared key-value store client
//!
//! The [`Store`] trait is the only way the rest of the crate talks to the
//! shared store. Backends:
//!
//! - [`RestStore`]: REST-style remote store (JSON command API over HTTPS)
//! - [`RedisStore`]: native Redis connection
//! - [`MemoryStore`]: in-process map for single-node setups and tests
//! - [`DisabledStore`]: no connection configured; every call is unavailable
//!
//! A store failure is always an `Err`, never `Ok(None)`, so callers can tell
//! "absent" apart from "could not ask".

pub mod disabled;
pub mod memory;
pub mod redis;
pub mod rest;
pub mod scripts;

pub use self::disabled::DisabledStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::rest::RestStore;

use crate::config::{StoreConfig, StoreKind};
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One sliding-window evaluation sent to the store
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Request time in ms since epoch
    pub now_ms: u64,
    /// Window length in ms
    pub window_ms: u64,
    /// Quota for the window
    pub max_requests: u32,
    /// Unique member recorded for this request
    pub member: String,
}

impl WindowRequest {
    pub fn new(now_ms: u64, window_ms: u64, max_requests: u32) -> Self {
        Self {
            now_ms,
            window_ms,
            max_requests,
            member: format!("{}-{}", now_ms, uuid::Uuid::new_v4()),
        }
    }

    pub fn window_start(&self) -> u64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// Outcome of the atomic trim/count/record/expire step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Entries in the window before this request
    pub count: u64,
    /// Whether this request was appended to the window
    pub recorded: bool,
    /// Oldest timestamp left in the window
    pub oldest_ms: Option<u64>,
}

impl WindowHit {
    /// Decode the `[count, recorded, oldest]` triple returned by the script
    pub fn from_reply(reply: &[i64]) -> Result<Self> {
        match reply {
            [count, recorded, oldest] if *count >= 0 && (*recorded == 0 || *recorded == 1) => {
                Ok(Self {
                    count: *count as u64,
                    recorded: *recorded == 1,
                    oldest_ms: (*oldest >= 0).then_some(*oldest as u64),
                })
            }
            other => Err(AdmissionError::MalformedReply(format!(
                "expected [count, recorded, oldest], got {:?}",
                other
            ))),
        }
    }
}

/// Minimal interface over the shared key-value store
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;

    /// Whether the store has a connection configured at all
    fn is_enabled(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Keys matching a glob pattern (`*` and `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically trim, count, record and expire a sliding window
    async fn record_hit(&self, key: &str, request: &WindowRequest) -> Result<WindowHit>;
}

/// Bound a store call by `timeout`
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdmissionError::StoreTimeout(timeout)),
    }
}

/// Translate a store glob into an anchored regex.
///
/// Follows `SCAN MATCH` syntax: `*`, `?`, `[abc]`, `[^a]`, `[a-z]` and `\x`
/// escapes. An unterminated `[` matches itself.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                push_literal(&mut expr, chars[i]);
            }
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    let class = &chars[i + 1..i + 1 + len];
                    expr.push('[');
                    for (n, c) in class.iter().enumerate() {
                        match c {
                            '^' if n == 0 => expr.push('^'),
                            '-' if n > 0 && n + 1 < class.len() => expr.push('-'),
                            other => push_literal(&mut expr, *other),
                        }
                    }
                    expr.push(']');
                    i += len + 1;
                }
                _ => push_literal(&mut expr, '['),
            },
            other => push_literal(&mut expr, other),
        }
        i += 1;
    }

    expr.push('$');
    Ok(Regex::new(&expr)?)
}

fn push_literal(expr: &mut String, c: char) {
    expr.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
}

/// Build the store described by `config`.
///
/// Missing or invalid settings produce a [`DisabledStore`] so the process
/// still starts in local-only mode. A Redis server that cannot be reached at
/// start is not fatal: the store retries the connection on demand.
pub async fn connect(config: &StoreConfig) -> Arc<dyn Store> {
    let timeout = config.timeout();

    match config.resolved_kind() {
        StoreKind::Disabled | StoreKind::Auto => {
            warn!("No shared store configured, admission runs in local-only mode");
            Arc::new(DisabledStore::new("no store configured"))
        }
        StoreKind::Memory => {
            info!("Using in-process memory store");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Rest => match (&config.url, &config.token) {
            (Some(url), Some(token)) => match RestStore::new(url, token.clone(), timeout) {
                Ok(store) => {
                    info!(url = %url, "Using REST store");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to build REST store client, using local-only mode");
                    Arc::new(DisabledStore::new("REST client could not be built"))
                }
            },
            _ => {
                warn!("REST store needs both a URL and a token, using local-only mode");
                Arc::new(DisabledStore::new("REST store credentials missing"))
            }
        },
        StoreKind::Redis => match &config.url {
            Some(url) => match RedisStore::connect(url, timeout).await {
                Ok(store) => {
                    info!("Using Redis store");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(error = %e, "Invalid Redis store settings, using local-only mode");
                    Arc::new(DisabledStore::new("Redis URL invalid"))
                }
            },
            None => {
                warn!("Redis store has no URL, using local-only mode");
                Arc::new(DisabledStore::new("Redis URL missing"))
            }
        },
    }
}
