//! Health probes (SPEC_FULL §10), grounded on
//! `original_source/streamstack/core/routes/health.py`'s three-endpoint
//! split: liveness, readiness, and a comprehensive diagnostic document.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Always 200 once the process is up; does not touch any dependency.
/// Prefer this for rolling-deploy liveness gating (Design Note §9(c)).
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// 503 if the provider is unhealthy. Documented caveat (Design Note
/// §9(c)): gating readiness on provider health means a flapping upstream
/// flaps this probe too, since rate limiting fails open rather than
/// denying — operators who can't tolerate that should use liveness-only
/// gating instead.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.gateway.health_snapshot().await;
    if snapshot.provider.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Comprehensive diagnostic document aggregating KV connectivity,
/// provider health, and queue depth, distinct from the two probes above.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.gateway.health_snapshot().await;
    let status = if snapshot.kv_healthy && snapshot.provider.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "checks": {
                "kv": { "healthy": snapshot.kv_healthy },
                "provider": {
                    "healthy": snapshot.provider.healthy,
                    "latency_ms": snapshot.provider.latency_ms,
                    "error": snapshot.provider.error,
                },
                "queue": {
                    "total": snapshot.queue.total,
                    "pending_len": snapshot.queue.pending_len,
                    "processing_len": snapshot.queue.processing_len,
                    "completed": snapshot.queue.completed,
                    "failed": snapshot.queue.failed,
                },
            }
        })),
    )
}
