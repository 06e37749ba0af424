use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Result type for admission operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Admission error types
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Malformed store reply: {0}")]
    MalformedReply(String),

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{message}")]
    RateLimited {
        message: String,
        limit: u32,
        reset_at: u64,
        retry_after_secs: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::StoreTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AdmissionError::Store(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::MalformedReply(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the shared store failed (unreachable, timed out, or replied
    /// with something unusable). Callers degrade instead of deciding.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            AdmissionError::StoreUnavailable(_)
                | AdmissionError::StoreTimeout(_)
                | AdmissionError::Store(_)
                | AdmissionError::MalformedReply(_)
        )
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let AdmissionError::RateLimited {
            message,
            limit,
            reset_at,
            retry_after_secs,
        } = self
        {
            let mut headers = HeaderMap::new();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_at));
            headers.insert("Retry-After", HeaderValue::from(retry_after_secs));

            let body = Json(json!({
                "error": message,
                "status": status.as_u16(),
                "retry_after": retry_after_secs,
            }));

            return (status, headers, body).into_response();
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AdmissionError::Config("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AdmissionError::StoreTimeout(Duration::from_millis(5)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AdmissionError::RateLimited {
                message: "slow down".to_string(),
                limit: 3,
                reset_at: 0,
                retry_after_secs: 1,
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(AdmissionError::StoreUnavailable("down".to_string()).is_store_failure());
        assert!(AdmissionError::MalformedReply("[]".to_string()).is_store_failure());
        assert!(!AdmissionError::Config("bad".to_string()).is_store_failure());
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let response = AdmissionError::RateLimited {
            message: "Too many requests".to_string(),
            limit: 10,
            reset_at: 1_700_000_060_000,
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "10");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "1700000060000");
        assert_eq!(headers.get("Retry-After").unwrap(), "42");
    }

    #[test]
    fn test_error_display() {
        let err = AdmissionError::StoreUnavailable("no store configured".to_string());
        assert_eq!(err.to_string(), "Store unavailable: no store configured");
    }
}
