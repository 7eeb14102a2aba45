//! `POST /v1/chat/completions` admission and forwarding glue (spec §4.4),
//! grounded on `original_source/streamstack/core/routes/chat.py`.

use crate::http_error::ApiError;
use crate::request_context::{extract_identifier, extract_idempotency_key, extract_request_id};
use crate::state::AppState;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use gateway_core::error::GatewayError;
use gateway_core::types::ChatRequest;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

pub async fn create_chat_completion(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let identifier = extract_identifier(&headers, Some(peer));
    let request_id = extract_request_id(&headers);
    let idempotency_key = extract_idempotency_key(&headers);

    if let Err(message) = request.validate() {
        return ApiError::from(GatewayError::Validation(message)).into_response();
    }

    let estimated_tokens =
        (request.estimate_prompt_tokens() + request.max_tokens_or_default()) as f64;

    let decision = state
        .gateway
        .check_admission(&identifier, estimated_tokens.max(1.0))
        .await;

    if !decision.allowed {
        warn!(identifier, "rate limit denied");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": { "message": "rate limit exceeded" }
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after.unwrap_or(1)),
        );
        headers.insert(
            "x-ratelimit-limit-requests",
            HeaderValue::from(decision.remaining.max(0.0) as u64),
        );
        headers.insert("x-ratelimit-remaining-requests", HeaderValue::from(0u64));
        headers.insert(
            "x-ratelimit-reset-requests",
            HeaderValue::from(decision.reset_at.max(0) as u64),
        );
        return response;
    }

    if !state.gateway.validate_model(&request.model).await {
        return ApiError::invalid_model(&request.model).into_response();
    }

    if state.config.queue.async_mode_enabled {
        return enqueue_chat_completion(state, request, idempotency_key, identifier).await;
    }

    if request.stream {
        stream_chat_completion(state, request, request_id).await
    } else {
        unary_chat_completion(state, request, request_id).await
    }
}

/// Asynchronous path (spec §4.4 "The queue is used when ..."): admit onto
/// the queue and hand the caller a polling id instead of dispatching
/// inline. A worker pool drains the queue and calls the provider.
async fn enqueue_chat_completion(
    state: AppState,
    request: ChatRequest,
    idempotency_key: Option<String>,
    user_id: String,
) -> Response {
    match state
        .gateway
        .enqueue(request, 0, None, idempotency_key, Some(user_id))
        .await
    {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id, "status": "queued" })),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

/// `GET` polling endpoint for the asynchronous path: returns the queued
/// item's result once the worker pool has completed it.
pub async fn get_chat_completion_result(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.gateway.queue_result(&id).await {
        Ok(Some(record)) => Json(serde_json::json!({
            "id": record.item_id,
            "status": if record.success { "completed" } else { "failed" },
            "result": record.result,
            "error": record.error,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id, "status": "pending" })),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn unary_chat_completion(state: AppState, request: ChatRequest, request_id: String) -> Response {
    let provider = state.gateway.provider_name().to_string();
    let started = Instant::now();
    match state.gateway.chat_completion(&request).await {
        Ok(response) => {
            crate::metrics::record_request(&provider, "success");
            crate::metrics::record_latency(&provider, started.elapsed().as_secs_f64());
            info!(request_id, "chat completion returned");
            let mut response = Json(response).into_response();
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert("x-request-id", value);
            }
            response
        }
        Err(err) => {
            crate::metrics::record_request(&provider, "error");
            ApiError::from(err).into_response()
        }
    }
}

async fn stream_chat_completion(state: AppState, request: ChatRequest, request_id: String) -> Response {
    let provider = state.gateway.provider_name().to_string();
    let chunk_stream = match state.gateway.chat_completion_stream(&request).await {
        Ok(stream) => stream,
        Err(err) => {
            crate::metrics::record_request(&provider, "error");
            return ApiError::from(err).into_response();
        }
    };
    crate::metrics::record_request(&provider, "success");

    // An error mid-stream emits one inline error event and ends the
    // stream without `[DONE]` (spec §7, "StreamingError after first
    // byte"); a clean upstream close emits `[DONE]` (spec §6).
    let sse_stream = async_stream::stream! {
        futures::pin_mut!(chunk_stream);
        loop {
            match chunk_stream.next().await {
                Some(Ok(chunk)) => {
                    yield Ok::<_, Infallible>(Event::default().data(
                        serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string()),
                    ));
                }
                Some(Err(err)) => {
                    warn!(error = %err, "streaming error after first byte, terminating without [DONE]");
                    yield Ok(Event::default().data(
                        serde_json::json!({ "error": { "message": err.message() } }).to_string(),
                    ));
                    return;
                }
                None => {
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
            }
        }
    };

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
