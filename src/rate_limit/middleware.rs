use super::service::AdmissionService;
use super::types::{CallerInfo, RateLimitDecision, RateLimitPolicy};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Identity set on the request by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Rate limiting middleware state: one policy guarding a group of routes
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    /// The admission service
    service: Arc<AdmissionService>,
    /// Policy applied to every request passing this guard
    policy: Arc<RateLimitPolicy>,
}

impl PolicyGuard {
    /// Create a new policy guard
    pub fn new(service: Arc<AdmissionService>, policy: Arc<RateLimitPolicy>) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract the caller identity from a request
pub fn caller_info(request: &Request) -> CallerInfo {
    let headers = request.headers();

    // The first X-Forwarded-For hop is the original client
    let forwarded = header_str(headers, "X-Forwarded-For")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    let real_ip = header_str(headers, "X-Real-IP").and_then(|v| v.parse::<IpAddr>().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());

    CallerInfo {
        ip: forwarded.or(real_ip).or(peer),
        user_id: request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|u| u.0.clone()),
        api_key: header_str(headers, "X-API-Key").map(str::to_string),
    }
}

/// Attach `X-RateLimit-*` headers describing a decision
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_at));
}

/// Axum middleware function for rate limiting.
///
/// Use with `axum::middleware::from_fn_with_state(guard, rate_limit_middleware)`.
pub async fn rate_limit_middleware(
    State(guard): State<PolicyGuard>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_info(&request);

    match guard.service.admit(&guard.policy, &caller).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Err(denied) => denied.into_response(),
    }
}
