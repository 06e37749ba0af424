use super::scripts::SLIDING_WINDOW_SCRIPT;
use super::{with_timeout, Store, WindowHit, WindowRequest};
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Minimum gap between attempts to establish the first connection
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Redis-backed shared store.
///
/// The connection is established lazily. Until the server has been reached
/// once, every command tries to connect (at most once per
/// [`RECONNECT_BACKOFF`]) and fails with `StoreUnavailable` otherwise. After
/// that the connection manager reconnects on its own.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    /// Sliding window script, loaded once and invoked by hash
    window_script: Script,
    /// Bound on every command
    timeout: Duration,
    created_at: Instant,
    /// Earliest next connect attempt, in ms since `created_at`
    next_attempt_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn map_redis_error(e: RedisError) -> AdmissionError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        AdmissionError::StoreUnavailable(e.to_string())
    } else {
        AdmissionError::Store(e.to_string())
    }
}

impl RedisStore {
    /// Build a store for `redis_url` without connecting yet.
    ///
    /// Only an unparseable URL is an error.
    pub fn new(redis_url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AdmissionError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            timeout,
            created_at: Instant::now(),
            next_attempt_ms: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Build a store and try to reach the server right away.
    ///
    /// An unreachable server is logged and the store is returned anyway;
    /// commands keep retrying the connection until it succeeds.
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self> {
        let store = Self::new(redis_url, timeout)?;

        match store.ping().await {
            Ok(()) => info!("Redis connection established"),
            Err(e) => warn!(error = %e, "Redis unreachable, will retry on demand"),
        }
        Ok(store)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        if self.elapsed_ms() < self.next_attempt_ms.load(Ordering::Acquire) {
            return Err(AdmissionError::StoreUnavailable(
                "Redis not connected, reconnect pending".to_string(),
            ));
        }

        let result = self
            .connection
            .get_or_try_init(|| {
                with_timeout(self.timeout, async {
                    ConnectionManager::new(self.client.clone())
                        .await
                        .map_err(map_redis_error)
                })
            })
            .await;

        match result {
            Ok(conn) => Ok(conn.clone()),
            Err(e) => {
                let next = self.elapsed_ms() + RECONNECT_BACKOFF.as_millis() as u64;
                self.next_attempt_ms.store(next, Ordering::Release);
                debug!(error = %e, "Redis connect attempt failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        with_timeout(self.timeout, async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(map_redis_error)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }

        with_timeout(self.timeout, async move {
            cmd.query_async::<_, ()>(&mut conn)
                .await
                .map_err(map_redis_error)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        with_timeout(self.timeout, async move {
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
                .map_err(map_redis_error)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        with_timeout(self.timeout, async move {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map(|_| ())
                .map_err(map_redis_error)
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        with_timeout(self.timeout, async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        })
        .await
    }

    async fn record_hit(&self, key: &str, request: &WindowRequest) -> Result<WindowHit> {
        let mut conn = self.connection().await?;
        let reply = with_timeout(self.timeout, async {
            self.window_script
                .key(key)
                .arg(request.now_ms)
                .arg(request.window_ms)
                .arg(request.max_requests)
                .arg(&request.member)
                .invoke_async::<_, Vec<i64>>(&mut conn)
                .await
                .map_err(map_redis_error)
        })
        .await?;

        debug!(key = key, reply = ?reply, "Sliding window script reply");
        WindowHit::from_reply(&reply)
    }
}
