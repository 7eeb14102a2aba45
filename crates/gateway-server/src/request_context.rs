//! Request-scoped field extraction shared by the chat route and the
//! tracing span layer (SPEC_FULL §9.1), so both attach the same
//! `request_id`/`client_id` values.

use axum::http::HeaderMap;
use std::net::SocketAddr;
use uuid::Uuid;

pub fn extract_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(value) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        return value.to_string();
    }
    if let Some(peer) = peer {
        return peer.ip().to_string();
    }
    "unknown".to_string()
}

pub fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn extract_idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.len() <= 256)
        .map(str::to_string)
}
