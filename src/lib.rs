pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod rate_limit;
pub mod store;

use crate::cache::TtlCache;
use crate::config::{AppConfig, StoreKind};
use crate::error::{AdmissionError, Result};
use crate::maintenance::Sweeper;
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::{AdmissionService, PolicyClass, PolicySet};
use crate::store::{MemoryStore, Store};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state for the service's own endpoints
#[derive(Debug, Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionService>,
    pub policies: Arc<PolicySet>,
    pub cache: TtlCache<Value>,
}

/// Liveness plus a view of which admission path is active
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let store = state.admission.store();
    let reachable = if store.is_enabled() {
        match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = store.backend(), error = %e, "Store ping failed");
                false
            }
        }
    } else {
        false
    };
    let cache = state.cache.stats().await;
    let policies: Vec<Value> = PolicyClass::ALL
        .into_iter()
        .map(|class| {
            let policy = state.policies.get(class);
            json!({
                "name": policy.name(),
                "requests": policy.max_requests(),
                "window_secs": policy.window_secs(),
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "store": {
            "backend": store.backend(),
            "distributed": state.admission.is_distributed(),
            "reachable": reachable,
        },
        "fallback_keys": state.admission.local().active_keys(),
        "cache": cache,
        "policies": policies,
    }))
}

/// Routes served by the admission process itself
pub fn build_router(state: AppState, metrics: Option<MetricsService>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);

    if let Some(metrics) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(metrics),
        );
    }

    app.layer(TraceLayer::new_for_http())
}

/// Start the admission service and serve until ctrl-c
pub async fn init_admission(config: AppConfig) -> Result<()> {
    config.validate()?;

    info!("Starting admission service");

    // The in-process store is kept by value so the sweeper can purge it
    let memory_store =
        (config.store.resolved_kind() == StoreKind::Memory).then(MemoryStore::new);
    let store: Arc<dyn Store> = match &memory_store {
        Some(memory) => {
            info!("Using in-process memory store");
            Arc::new(memory.clone())
        }
        None => store::connect(&config.store).await,
    };
    let policies = Arc::new(PolicySet::from_config(&config.rate_limiting)?);
    let admission = Arc::new(AdmissionService::new(
        store,
        clock::system(),
        config.rate_limiting.key_prefix.clone(),
    ));
    let cache: TtlCache<Value> = TtlCache::new(
        config.cache.namespace.clone(),
        config.cache.max_capacity,
        config.cache.default_ttl(),
    );

    let mut sweeper = Sweeper::new(config.cache.sweep_interval())
        .register(Arc::new(cache.clone()))
        .register(Arc::new(admission.local().clone()));
    if let Some(memory) = memory_store {
        sweeper = sweeper.register(Arc::new(memory));
    }
    let sweeper = sweeper.spawn();

    let metrics = match MetricsService::new() {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let app = build_router(
        AppState {
            admission,
            policies,
            cache,
        },
        metrics,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| AdmissionError::Internal(format!("Server error: {}", e)))?;

    sweeper.shutdown().await;
    info!("Admission service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admission=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
