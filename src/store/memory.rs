use super::{glob_to_regex, Store, WindowHit, WindowRequest};
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
enum MemoryValue {
    Text(String),
    /// (score ms, member), ascending by score
    Window(VecDeque<(u64, String)>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-process store.
///
/// Window updates run while holding the key's map entry, so they are atomic
/// within this process only. Suitable for single-instance deployments and
/// tests; multiple instances each get their own independent state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys from the map; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return Ok(None);
        }

        match &entry.value {
            MemoryValue::Text(text) => Ok(Some(text.clone())),
            MemoryValue::Window(_) => Err(AdmissionError::Store(format!(
                "WRONGTYPE key {} holds a window, not a string",
                key
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();

        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn record_hit(&self, key: &str, request: &WindowRequest) -> Result<WindowHit> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Window(VecDeque::new()),
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.value = MemoryValue::Window(VecDeque::new());
        }

        let MemoryValue::Window(window) = &mut entry.value else {
            return Err(AdmissionError::Store(format!(
                "WRONGTYPE key {} holds a string, not a window",
                key
            )));
        };

        let window_start = request.window_start();
        while window.front().map(|(score, _)| *score < window_start).unwrap_or(false) {
            window.pop_front();
        }

        let count = window.len() as u64;
        let recorded = count < request.max_requests as u64;
        if recorded {
            let at = window.partition_point(|(score, _)| *score <= request.now_ms);
            window.insert(at, (request.now_ms, request.member.clone()));
        }

        let oldest_ms = window.front().map(|(score, _)| *score);
        entry.expires_at = Some(now + Duration::from_millis(request.window_ms));

        debug!(key = key, count = count, recorded = recorded, "Recorded window hit");

        Ok(WindowHit {
            count,
            recorded,
            oldest_ms,
        })
    }
}
