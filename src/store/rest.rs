use super::scripts::SLIDING_WINDOW_SCRIPT;
use super::{with_timeout, Store, WindowHit, WindowRequest};
use crate::config::SecretString;
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Reply envelope of the REST command API
#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// REST-style remote store.
///
/// Each command is sent as a JSON array (`["SET", "k", "v"]`) in a POST body
/// to the base URL with a bearer token; replies are `{"result": ...}` or
/// `{"error": "..."}`. The sliding window runs as one `EVAL`, so it is atomic
/// on the server no matter how the HTTP round trip ends.
#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
    timeout: Duration,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("base_url", &self.base_url)
            .field("client", &"<reqwest::Client>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RestStore {
    /// Create a new REST store client
    pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdmissionError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    /// Send one command and return its `result` value
    async fn command(&self, args: Vec<String>) -> Result<Value> {
        let name = args.first().cloned().unwrap_or_default();

        with_timeout(self.timeout, async {
            let response = self
                .client
                .post(&self.base_url)
                .bearer_auth(self.token.expose_secret())
                .json(&args)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        AdmissionError::StoreTimeout(self.timeout)
                    } else {
                        AdmissionError::StoreUnavailable(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_server_error() {
                return Err(AdmissionError::StoreUnavailable(format!(
                    "{} returned {}",
                    name, status
                )));
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(AdmissionError::StoreUnavailable(format!(
                    "store rejected credentials ({})",
                    status
                )));
            }

            let reply: CommandReply = response.json().await.map_err(|e| {
                AdmissionError::MalformedReply(format!("{} reply is not JSON: {}", name, e))
            })?;

            if let Some(error) = reply.error {
                return Err(AdmissionError::Store(error));
            }

            debug!(command = %name, status = %status, "Store command completed");
            Ok(reply.result.unwrap_or(Value::Null))
        })
        .await
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Store for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(cmd(&["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(AdmissionError::MalformedReply(format!(
                "GET returned {}",
                other
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut args = cmd(&["SET", key, value]);
        if let Some(ttl) = ttl {
            args.push("PX".to_string());
            args.push(ttl.as_millis().max(1).to_string());
        }
        self.command(args).await.map(|_| ())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.command(cmd(&["DEL", key])).await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        match self.command(cmd(&["PING"])).await? {
            Value::String(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
            other => Err(AdmissionError::MalformedReply(format!(
                "PING returned {}",
                other
            ))),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();

        loop {
            let reply = self
                .command(cmd(&["SCAN", cursor.as_str(), "MATCH", pattern, "COUNT", "100"]))
                .await?;

            let (next, batch) = match reply {
                Value::Array(parts) if parts.len() == 2 => {
                    let next = match &parts[0] {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        other => {
                            return Err(AdmissionError::MalformedReply(format!(
                                "SCAN cursor {}",
                                other
                            )))
                        }
                    };
                    let batch = match &parts[1] {
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect::<Vec<_>>(),
                        other => {
                            return Err(AdmissionError::MalformedReply(format!(
                                "SCAN keys {}",
                                other
                            )))
                        }
                    };
                    (next, batch)
                }
                other => {
                    return Err(AdmissionError::MalformedReply(format!(
                        "SCAN returned {}",
                        other
                    )))
                }
            };

            keys.extend(batch);
            if next == "0" {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn record_hit(&self, key: &str, request: &WindowRequest) -> Result<WindowHit> {
        let args = vec![
            "EVAL".to_string(),
            SLIDING_WINDOW_SCRIPT.to_string(),
            "1".to_string(),
            key.to_string(),
            request.now_ms.to_string(),
            request.window_ms.to_string(),
            request.max_requests.to_string(),
            request.member.clone(),
        ];

        let reply = match self.command(args).await? {
            Value::Array(items) => items
                .iter()
                .map(as_i64)
                .collect::<Option<Vec<i64>>>()
                .ok_or_else(|| {
                    AdmissionError::MalformedReply(format!("EVAL returned {:?}", items))
                })?,
            other => {
                return Err(AdmissionError::MalformedReply(format!(
                    "EVAL returned {}",
                    other
                )))
            }
        };

        WindowHit::from_reply(&reply)
    }
}
