//! Axum router assembly (SPEC_FULL "Workspace shape"), grounded on
//! `vkteams-bot::bot::webhook::build_router`'s layer stack: trace,
//! timeout, CORS.

use crate::request_context::{extract_identifier, extract_request_id};
use crate::routes::{chat, health, metrics};
use crate::state::AppState;
use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const REQUEST_TIMEOUT_SECS: u64 = 120;

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| true))
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    }
    .allow_methods([axum::http::Method::GET, axum::http::Method::POST]);

    // Request-scoped fields on every inbound span (SPEC_FULL §9.1),
    // grounded on `vkteams-bot::bot::webhook`'s span-per-request wiring.
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let client_id = extract_identifier(request.headers(), peer);
        let request_id = extract_request_id(request.headers());
        tracing::info_span!(
            "http_request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id,
            client_id,
        )
    });

    Router::new()
        .route("/v1/chat/completions", post(chat::create_chat_completion))
        .route(
            "/v1/chat/completions/{id}",
            get(chat::get_chat_completion_result),
        )
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route(&state.config.server.metrics_path, get(metrics::scrape))
        .with_state(state)
        .layer((
            trace_layer,
            TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
            cors,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use gateway_core::config::Config;
    use gateway_core::error::{KvResult, ProviderResult};
    use gateway_core::kv::{KvStore, TokenBucketOutcome};
    use gateway_core::provider::{ChatChunkStream, Provider, ProviderHealth, ProviderUsage};
    use gateway_core::queue::{Queue, QueueConfig};
    use gateway_core::rate_limiter::{RateLimiter, RateLimiterConfig};
    use gateway_core::types::{
        ChatChunk, ChatChunkChoice, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatUsage,
        ChatChoice, Role,
    };
    use gateway_core::Gateway;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Always-allow KV fake: token buckets never deny. Sufficient for
    /// single-request tests where rate limiting is not under test.
    #[derive(Default)]
    struct NoopKv;

    #[async_trait]
    impl KvStore for NoopKv {
        async fn eval_token_bucket(
            &self,
            _key: &str,
            capacity: f64,
            _refill_rate: f64,
            refill_period: i64,
            _requested: f64,
            now: i64,
        ) -> KvResult<TokenBucketOutcome> {
            Ok(TokenBucketOutcome {
                allowed: true,
                remaining: capacity,
                reset_at: now + refill_period,
                retry_after: 0,
            })
        }
        async fn lpush(&self, _: &str, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn rpush(&self, _: &str, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn blpop(&self, _: &str, _: u64) -> KvResult<Option<String>> {
            Ok(None)
        }
        async fn llen(&self, _: &str) -> KvResult<i64> {
            Ok(0)
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn hget(&self, _: &str, _: &str) -> KvResult<Option<String>> {
            Ok(None)
        }
        async fn hdel(&self, _: &str, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn hlen(&self, _: &str) -> KvResult<i64> {
            Ok(0)
        }
        async fn hgetall(&self, _: &str) -> KvResult<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn hincrby(&self, _: &str, _: &str, _: i64) -> KvResult<i64> {
            Ok(0)
        }
        async fn get(&self, _: &str) -> KvResult<Option<String>> {
            Ok(None)
        }
        async fn setex(&self, _: &str, _: u64, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn expire(&self, _: &str, _: u64) -> KvResult<()> {
            Ok(())
        }
        async fn del(&self, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn ping(&self) -> KvResult<()> {
            Ok(())
        }
    }

    /// Real token-bucket arithmetic (same algorithm as
    /// `RedisKv::eval_token_bucket`'s Lua script, reimplemented in-process)
    /// so Scenario 2's exhaustion sequence is exercised for real instead of
    /// being waved through by an always-allow fake.
    #[derive(Default)]
    struct BucketKv {
        buckets: std::sync::Mutex<HashMap<String, (f64, i64)>>,
    }

    #[async_trait]
    impl KvStore for BucketKv {
        async fn eval_token_bucket(
            &self,
            key: &str,
            capacity: f64,
            refill_rate: f64,
            refill_period: i64,
            requested: f64,
            now: i64,
        ) -> KvResult<TokenBucketOutcome> {
            let mut buckets = self.buckets.lock().unwrap();
            let (mut tokens, mut last_refill) = *buckets.get(key).unwrap_or(&(capacity, now));

            let periods_elapsed = ((now - last_refill) as f64 / refill_period as f64).floor();
            if periods_elapsed > 0.0 {
                tokens = (tokens + periods_elapsed * refill_rate).min(capacity);
                last_refill += (periods_elapsed as i64) * refill_period;
            }

            let (allowed, retry_after) = if tokens >= requested {
                tokens -= requested;
                (true, 0)
            } else {
                let periods_needed = ((requested - tokens) / refill_rate.max(1.0)).ceil() as i64;
                (false, (periods_needed * refill_period).max(1))
            };

            buckets.insert(key.to_string(), (tokens, last_refill));
            Ok(TokenBucketOutcome {
                allowed,
                remaining: tokens,
                reset_at: last_refill + refill_period,
                retry_after,
            })
        }
        async fn lpush(&self, _: &str, _: &str) -> KvResult<()> {
            unimplemented!()
        }
        async fn rpush(&self, _: &str, _: &str) -> KvResult<()> {
            unimplemented!()
        }
        async fn blpop(&self, _: &str, _: u64) -> KvResult<Option<String>> {
            unimplemented!()
        }
        async fn llen(&self, _: &str) -> KvResult<i64> {
            unimplemented!()
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> KvResult<()> {
            unimplemented!()
        }
        async fn hget(&self, _: &str, _: &str) -> KvResult<Option<String>> {
            unimplemented!()
        }
        async fn hdel(&self, _: &str, _: &str) -> KvResult<()> {
            unimplemented!()
        }
        async fn hlen(&self, _: &str) -> KvResult<i64> {
            unimplemented!()
        }
        async fn hgetall(&self, _: &str) -> KvResult<HashMap<String, String>> {
            unimplemented!()
        }
        async fn hincrby(&self, _: &str, _: &str, _: i64) -> KvResult<i64> {
            unimplemented!()
        }
        async fn get(&self, _: &str) -> KvResult<Option<String>> {
            Ok(None)
        }
        async fn setex(&self, _: &str, _: u64, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn expire(&self, _: &str, _: u64) -> KvResult<()> {
            Ok(())
        }
        async fn del(&self, _: &str) -> KvResult<()> {
            Ok(())
        }
        async fn ping(&self) -> KvResult<()> {
            Ok(())
        }
    }

    /// Provider test double returning a fixed completion (Scenario 1) and a
    /// fixed three-chunk stream (Scenario 5) instead of calling upstream.
    struct FakeProvider;

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        fn supported_models(&self) -> Vec<String> {
            vec!["gpt-3.5-turbo".to_string()]
        }
        async fn validate_model(&self, model: &str) -> bool {
            model == "gpt-3.5-turbo"
        }
        async fn chat_completion(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
            Ok(ChatResponse {
                id: "chatcmpl-test".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model.clone(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage {
                        role: Role::Assistant,
                        content: "Hello!".to_string(),
                        name: None,
                    },
                    finish_reason: "stop".to_string(),
                }],
                usage: ChatUsage {
                    prompt_tokens: 5,
                    completion_tokens: 3,
                    total_tokens: 8,
                },
            })
        }
        async fn chat_completion_stream(&self, request: &ChatRequest) -> ProviderResult<ChatChunkStream> {
            let model = request.model.clone();
            let chunk = |content: &str, finish_reason: Option<&str>| ChatChunk {
                id: "chatcmpl-test".to_string(),
                object: "chat.completion.chunk".to_string(),
                created: 0,
                model: model.clone(),
                choices: vec![ChatChunkChoice {
                    index: 0,
                    delta: ChatDelta {
                        role: None,
                        content: Some(content.to_string()),
                    },
                    finish_reason: finish_reason.map(str::to_string),
                }],
            };
            let chunks = vec![
                Ok(chunk("He", None)),
                Ok(chunk("llo", None)),
                Ok(chunk("!", Some("stop"))),
            ];
            Ok(futures::stream::iter(chunks).boxed())
        }
        async fn health(&self) -> ProviderHealth {
            ProviderHealth {
                healthy: true,
                latency_ms: Some(1.0),
                error: None,
            }
        }
        async fn usage(&self) -> ProviderUsage {
            ProviderUsage::default()
        }
        fn estimate_cost(&self, _request: &ChatRequest) -> f64 {
            0.0
        }
        async fn close(&self) {}
    }

    fn test_state_with(kv: Arc<dyn KvStore>, rate_limit: RateLimiterConfig) -> AppState {
        let rate_limiter = RateLimiter::new(Arc::clone(&kv), rate_limit);
        let queue = Arc::new(Queue::new("default", Arc::clone(&kv), QueueConfig::default()));
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider);
        let gateway = Arc::new(Gateway::new(kv, rate_limiter, queue, provider));

        AppState {
            gateway,
            config: Arc::new(Config::default()),
            metrics_handle: crate::metrics::install_recorder().expect("install recorder"),
        }
    }

    fn test_state() -> AppState {
        test_state_with(Arc::new(NoopKv::default()), RateLimiterConfig::default())
    }

    fn chat_request(peer_port: u16) -> Request<Body> {
        let body = serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("x-request-id", "req-1")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(std::net::SocketAddr::from((
                [127, 0, 0, 1],
                peer_port,
            ))));
        request
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_reflects_provider_health() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completion_rejects_unknown_model() {
        let app = build_router(test_state());
        let body = serde_json::json!({
            "model": "not-a-real-model",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(std::net::SocketAddr::from((
                [127, 0, 0, 1],
                0,
            ))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Scenario 1 (unary happy path): a request with no rate pressure
    /// returns 200 with an assistant message, consistent usage totals, and
    /// the caller's request id echoed back.
    #[tokio::test]
    async fn scenario_1_unary_happy_path() {
        let app = build_router(test_state());
        let response = app.oneshot(chat_request(1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "req-1"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ChatResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.choices[0].message.role, Role::Assistant);
        assert_eq!(
            parsed.usage.total_tokens,
            parsed.usage.prompt_tokens + parsed.usage.completion_tokens
        );
    }

    /// Scenario 2 (rate-limit exhaustion): with
    /// `rate_limit_requests_per_minute=2, burst=0`, three requests from the
    /// same identifier within the same window yield 200, 200, 429; the 429
    /// carries `Retry-After >= 1` and a zeroed remaining-requests header.
    #[tokio::test]
    async fn scenario_2_rate_limit_exhaustion() {
        let app = build_router(test_state_with(
            Arc::new(BucketKv::default()),
            RateLimiterConfig {
                requests_per_minute: 2,
                tokens_per_minute: 1_000_000,
                burst_size: 0,
            },
        ));

        let first = app.clone().oneshot(chat_request(2)).await.unwrap();
        let second = app.clone().oneshot(chat_request(2)).await.unwrap();
        let third = app.clone().oneshot(chat_request(2)).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

        let retry_after: u64 = third
            .headers()
            .get(axum::http::header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        assert_eq!(
            third.headers().get("x-ratelimit-remaining-requests").unwrap(),
            "0"
        );
    }

    /// Scenario 5 (streaming pass-through): the provider emits
    /// `["He","llo","!"]` then closes; the client receives one SSE event
    /// per chunk, framed, ending in `data: [DONE]`.
    #[tokio::test]
    async fn scenario_5_streaming_chunk_sequence_ends_in_done() {
        let app = build_router(test_state());
        let body = serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        });
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(std::net::SocketAddr::from((
                [127, 0, 0, 1],
                3,
            ))));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        let he_pos = text.find("He").unwrap();
        let llo_pos = text.find("llo").unwrap();
        let bang_pos = text.find('!').unwrap();
        let done_pos = text.rfind("[DONE]").unwrap();
        assert!(he_pos < llo_pos && llo_pos < bang_pos && bang_pos < done_pos);
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }
}
