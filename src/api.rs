//! HTTP surface: the admission middleware, health and metrics endpoints and
//! a small cache API.

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};

use crate::{
    cache::Ttl,
    error::GovernorError,
    limiter::Decision,
    service::{Admission, GovernanceService},
    tasks::InvalidationQueue,
    utils::KeyPattern,
};

/// State shared by the middleware and every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GovernanceService>,
    pub invalidations: InvalidationQueue,
}

/// Build the router with admission applied to every route
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/readiness", get(readiness_handler))
        .route("/health/liveness", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/cache", axum::routing::delete(invalidate_handler))
        .route(
            "/api/v1/cache/:key",
            get(get_entry_handler)
                .put(put_entry_handler)
                .delete(delete_entry_handler),
        )
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

/// Admission middleware.
///
/// Denied requests never reach the handler and get a 429 with
/// `Retry-After`; admitted responses carry the `X-RateLimit-*` headers.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let admission = state
        .service
        .admit(request.uri().path(), request.headers(), peer)
        .await;

    match admission {
        Admission::Bypassed => next.run(request).await,
        Admission::Decided(decision) if decision.admitted => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            for (name, value) in decision.headers() {
                headers.insert(name, value);
            }
            response
        }
        Admission::Decided(decision) => rate_limited_response(&decision),
    }
}

/// 429 response for a denied decision
pub fn rate_limited_response(decision: &Decision) -> Response {
    let body = json!({
        "success": false,
        "error": {
            "code": "RATE_LIMIT_EXCEEDED",
            "message": format!("Rate limit exceeded. Retry after {} seconds", decision.retry_after),
            "details": { "retry_after": decision.retry_after }
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    for (name, value) in decision.headers() {
        headers.insert(name, value);
    }
    response
}

/// Error returned by handlers, rendered as the standard error envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(key: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "CACHE_MISS",
            message: format!("No cached value for key {}", key),
        }
    }
}

impl From<GovernorError> for ApiError {
    fn from(err: GovernorError) -> Self {
        let (status, code) = match &err {
            GovernorError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            e if e.is_store_failure() => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "details": {}
            }
        });
        (self.status, Json(body)).into_response()
    }
}

fn success(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let report = state.service.health().await;
    success(json!(report))
}

async fn readiness_handler() -> Json<Value> {
    success(json!({
        "status": "ready",
        "message": "Service is ready to accept traffic"
    }))
}

async fn liveness_handler() -> Json<Value> {
    success(json!({
        "status": "alive",
        "message": "Service is alive"
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.service.metrics().registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn get_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cache = state.service.cache();
    let value: Value = cache.get(&key).await.ok_or_else(|| ApiError::not_found(&key))?;
    let ttl = cache.ttl_remaining(&key).await;

    Ok(success(json!({ "key": key, "value": value, "ttl": ttl })))
}

#[derive(Debug, Deserialize)]
pub struct PutEntryRequest {
    pub value: Value,
    /// Seconds; the configured default applies when absent
    pub ttl: Option<i64>,
}

async fn put_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<PutEntryRequest>,
) -> Result<Json<Value>, ApiError> {
    let ttl = req.ttl.map(Ttl::try_from).transpose()?;
    let stored = state.service.cache().set(&key, &req.value, ttl).await;

    Ok(success(json!({ "key": key, "stored": stored })))
}

async fn delete_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<Value> {
    let deleted = state.service.cache().delete(&key).await;
    success(json!({ "key": key, "deleted": deleted }))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateParams {
    pub pattern: String,
}

async fn invalidate_handler(
    State(state): State<AppState>,
    Query(params): Query<InvalidateParams>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if params.pattern.is_empty() {
        return Err(GovernorError::Validation("pattern must not be empty".to_string()).into());
    }
    KeyPattern::new(&params.pattern)?;

    let queued = state.invalidations.submit(params.pattern.clone());
    Ok((
        StatusCode::ACCEPTED,
        success(json!({ "pattern": params.pattern, "queued": queued })),
    ))
}
