use axum::{
    extract::{Path, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::EngineError;
use crate::gate::{Decision, EnforcementGate};
use crate::metrics::Metrics;
use crate::policy::{PolicySpec, PolicyStore, PolicyUpdate};
use crate::store::CounterStore;

/// Shared state for the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<EnforcementGate>,
    pub policies: Arc<PolicyStore>,
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn CounterStore>,
}

/// Build the admin and decision router: policy management, the check
/// endpoint the protected transport calls, health and metrics export.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/policies", post(create_policy).get(list_policies))
        .route("/policies/:id", get(get_policy).put(update_policy))
        .route("/policies/:id/history", get(policy_history))
        .route("/policies/:id/rollback", post(rollback_latest))
        .route("/policies/:id/rollback/:version", post(rollback_version))
        .route("/check", post(check))
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn error_response(error: EngineError) -> Response {
    match error {
        EngineError::InvalidPolicy(violations) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": violations })),
        )
            .into_response(),
        EngineError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} not found", what) })),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": other.to_string() })),
        )
            .into_response(),
    }
}

async fn create_policy(
    State(state): State<AppState>,
    Json(spec): Json<PolicySpec>,
) -> Response {
    match state.policies.create(spec).await {
        Ok(policy) => {
            state.metrics.record_policy_operation("create");
            (StatusCode::CREATED, Json(policy)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_policies(State(state): State<AppState>) -> Response {
    Json(state.policies.list().await).into_response()
}

async fn get_policy(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.policies.get(id).await {
        Ok(policy) => Json(policy).into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(update): Json<PolicyUpdate>,
) -> Response {
    match state.policies.update(id, update).await {
        Ok(policy) => {
            state.metrics.record_policy_operation("update");
            Json(policy).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn policy_history(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.policies.history(id).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => error_response(e),
    }
}

async fn rollback_latest(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    rollback(state, id, None).await
}

async fn rollback_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(u64, u32)>,
) -> Response {
    rollback(state, id, Some(version)).await
}

async fn rollback(state: AppState, id: u64, version: Option<u32>) -> Response {
    match state.policies.rollback(id, version).await {
        Ok(policy) => {
            state.metrics.record_policy_operation("rollback");
            Json(policy).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    client_key: String,
    policy_id: u64,
}

/// Map an engine decision onto the wire: pass-through vs 429, with the
/// informational quota headers attached either way.
async fn check(State(state): State<AppState>, Json(req): Json<CheckRequest>) -> Response {
    match state.gate.decide(&req.client_key, req.policy_id).await {
        Ok(decision) => decision_response(decision),
        Err(e) => error_response(e),
    }
}

fn decision_response(decision: Decision) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Limit", header_value(decision.limit as u64));
    headers.insert("X-RateLimit-Remaining", header_value(decision.remaining));
    headers.insert(
        "X-RateLimit-Burst-Limit",
        header_value(decision.burst_limit as u64),
    );
    headers.insert(
        "X-RateLimit-Burst-Remaining",
        header_value(decision.burst_remaining),
    );

    if decision.allowed {
        (StatusCode::OK, headers, Json(decision)).into_response()
    } else {
        let retry_after_secs = decision.retry_after_ms.div_ceil(1_000);
        headers.insert(RETRY_AFTER, header_value(retry_after_secs));
        (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            Json(json!({
                "error": "Rate limit exceeded. Please try again later.",
                "retry_after_ms": decision.retry_after_ms,
            })),
        )
            .into_response()
    }
}

fn header_value(value: u64) -> HeaderValue {
    HeaderValue::from(value)
}

async fn health_check(State(state): State<AppState>) -> Response {
    match state.store.health_check().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry().gather();

    match encoder.encode_to_string(&families) {
        Ok(body) => body.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
