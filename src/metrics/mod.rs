use crate::error::{AdmissionError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            AdmissionError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "admission_decisions_total",
            "Admission decisions by policy, deciding limiter and outcome"
        );
        describe_counter!(
            "admission_store_fallbacks_total",
            "Checks that fell back to the local limiter because the shared store failed"
        );
        describe_counter!(
            "admission_cache_lookups_total",
            "Cache lookups by cache name and result"
        );
        describe_counter!(
            "admission_sweep_removed_total",
            "Expired entries removed by the background sweeper"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record an admission decision
pub fn record_decision(policy: &str, source: &str, allowed: bool) {
    let labels = [
        ("policy", policy.to_string()),
        ("source", source.to_string()),
        ("outcome", outcome(allowed).to_string()),
    ];
    counter!("admission_decisions_total", &labels).increment(1);
}

/// Record a fallback from the shared store to the local limiter
pub fn record_store_fallback(policy: &str, error: &AdmissionError) {
    let labels = [
        ("policy", policy.to_string()),
        ("reason", fallback_reason(error).to_string()),
    ];
    counter!("admission_store_fallbacks_total", &labels).increment(1);
}

/// Record a cache lookup
pub fn record_cache_lookup(cache: &str, hit: bool) {
    let labels = [
        ("cache", cache.to_string()),
        ("result", if hit { "hit" } else { "miss" }.to_string()),
    ];
    counter!("admission_cache_lookups_total", &labels).increment(1);
}

/// Record entries removed by one sweep of a target
pub fn record_sweep(target: &str, removed: usize) {
    let labels = [("target", target.to_string())];
    counter!("admission_sweep_removed_total", &labels).increment(removed as u64);
}

fn outcome(allowed: bool) -> &'static str {
    if allowed {
        "allowed"
    } else {
        "denied"
    }
}

/// Low-cardinality label for why the store could not decide
fn fallback_reason(error: &AdmissionError) -> &'static str {
    match error {
        AdmissionError::StoreUnavailable(_) => "unavailable",
        AdmissionError::StoreTimeout(_) => "timeout",
        AdmissionError::MalformedReply(_) => "malformed_reply",
        _ => "error",
    }
}
