//! HTTP surface: limiter endpoints, an IP-keyed middleware, health and metrics.

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

use crate::{
    error::RateLimitError,
    limiter::{RateLimitResult, RateLimiter},
    metrics::Metrics,
    registry::LimiterRegistry,
};

const DEFAULT_REJECTION: &str = "Too many requests, please try again later.";

#[derive(Clone)]
pub struct AppState {
    pub registry: LimiterRegistry,
    pub metrics: Arc<Metrics>,
}

/// 429 response for an action over budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub retry_after: u64,
    pub reset: i64,
    pub message: String,
}

impl RateLimitRejection {
    pub fn from_result(result: &RateLimitResult, now: i64) -> Self {
        Self {
            retry_after: result.retry_after(now),
            reset: result.reset,
            message: result
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_REJECTION.to_string()),
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("retry-after", self.retry_after.to_string()),
                ("x-ratelimit-remaining", "0".to_string()),
                ("x-ratelimit-reset", self.reset.to_string()),
            ],
            Json(json!({
                "error": self.message,
                "retry_after": self.retry_after,
            })),
        )
            .into_response()
    }
}

/// Errors surfaced by the limiter endpoints
pub struct ApiError(RateLimitError);

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RateLimitError::LimiterNotFound(_) => StatusCode::NOT_FOUND,
            RateLimitError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Client address: `x-real-ip`, then the first `x-forwarded-for` hop, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let peer_ip = peer.map(|addr| addr.ip().to_string());
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .or(peer_ip.as_deref())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}

/// Middleware recording one action per client IP against `limiter`.
///
/// Mount with `axum::middleware::from_fn_with_state(limiter, enforce)`.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = client_ip(request.headers(), peer);

    if limiter.increment(&ip).await {
        return next.run(request).await;
    }

    warn!("Rate limit exceeded for {} on {}", ip, limiter.prefix());
    let now = limiter.now();
    let result = limiter.check(&ip).await;
    RateLimitRejection::from_result(&result, now).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/limits/:limiter/:identifier",
            get(check_limit).post(record_action).delete(reset_limit),
        )
        .with_state(state)
}

async fn check_limit(
    State(state): State<AppState>,
    Path((prefix, identifier)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let limiter = state.registry.get(&prefix)?;
    let now = limiter.now();
    let result = limiter.check(&identifier).await;

    if result.success {
        Ok(Json(result).into_response())
    } else {
        Ok(RateLimitRejection::from_result(&result, now).into_response())
    }
}

async fn record_action(
    State(state): State<AppState>,
    Path((prefix, identifier)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let limiter = state.registry.get(&prefix)?;

    if limiter.increment(&identifier).await {
        return Ok(Json(json!({ "allowed": true })).into_response());
    }

    info!("Rejected action for {} on {}", identifier, prefix);
    let now = limiter.now();
    let result = limiter.check(&identifier).await;
    Ok(RateLimitRejection::from_result(&result, now).into_response())
}

async fn reset_limit(
    State(state): State<AppState>,
    Path((prefix, identifier)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let limiter = state.registry.get(&prefix)?;
    if limiter.reset(&identifier).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.registry.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "limiters": state.registry.prefixes(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
