use super::{Store, WindowHit, WindowRequest};
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Store used when no connection is configured.
///
/// Every operation reports [`AdmissionError::StoreUnavailable`], which sends
/// the limiter to its local fallback and turns cache reads into misses.
#[derive(Debug, Clone)]
pub struct DisabledStore {
    reason: String,
}

impl DisabledStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(AdmissionError::StoreUnavailable(self.reason.clone()))
    }
}

impl Default for DisabledStore {
    fn default() -> Self {
        Self::new("no store configured")
    }
}

#[async_trait]
impl Store for DisabledStore {
    fn backend(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.unavailable()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        self.unavailable()
    }

    async fn del(&self, _key: &str) -> Result<()> {
        self.unavailable()
    }

    async fn ping(&self) -> Result<()> {
        self.unavailable()
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
        self.unavailable()
    }

    async fn record_hit(&self, _key: &str, _request: &WindowRequest) -> Result<WindowHit> {
        self.unavailable()
    }
}
