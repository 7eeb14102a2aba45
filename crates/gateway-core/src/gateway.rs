//! Composition root tying the three core subsystems together (spec §4.4).
//!
//! `gateway-server`'s axum handlers are thin translators between HTTP and
//! this struct: header extraction, SSE framing, and status-code mapping
//! live there, while the admission decision, model validation, and
//! provider dispatch live here so they're testable without an HTTP stack.

use crate::error::{ProviderResult, QueueResult};
use crate::kv::KvStore;
use crate::provider::{ChatChunkStream, Provider, ProviderHealth};
use crate::queue::{QueueItem, Queue, QueueResultRecord, QueueStats};
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::types::{ChatRequest, ChatResponse};
use serde_json::Value;
use std::sync::Arc;

/// Aggregated health document (spec.md §10, recovered from
/// `streamstack.core.routes.health.health_check`).
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub kv_healthy: bool,
    pub provider: ProviderHealth,
    pub queue: QueueStats,
}

/// The request-handling core: rate limiter, queue, and active provider,
/// constructed once at startup and shared across handlers via `Arc`.
pub struct Gateway {
    kv: Arc<dyn KvStore>,
    rate_limiter: RateLimiter,
    queue: Arc<Queue>,
    provider: Arc<dyn Provider>,
}

impl Gateway {
    pub fn new(
        kv: Arc<dyn KvStore>,
        rate_limiter: RateLimiter,
        queue: Arc<Queue>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            kv,
            rate_limiter,
            queue,
            provider,
        }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Step 3 of spec §4.4's flow: check both rate-limit dimensions for
    /// `identifier`.
    pub async fn check_admission(&self, identifier: &str, estimated_tokens: f64) -> RateLimitDecision {
        self.rate_limiter.check_both(identifier, estimated_tokens).await
    }

    /// Step 4: reject unknown models before spending any downstream
    /// resources.
    pub async fn validate_model(&self, model: &str) -> bool {
        self.provider.validate_model(model).await
    }

    pub async fn chat_completion(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        self.provider.chat_completion(request).await
    }

    pub async fn chat_completion_stream(&self, request: &ChatRequest) -> ProviderResult<ChatChunkStream> {
        self.provider.chat_completion_stream(request).await
    }

    /// Used only when the operator enables asynchronous processing (spec
    /// §4.4, "The queue is used when ..."); the default path is
    /// pass-through and never touches the queue.
    pub async fn enqueue(
        &self,
        request: ChatRequest,
        priority: i32,
        timeout_seconds: Option<i64>,
        idempotency_key: Option<String>,
        user_id: Option<String>,
    ) -> QueueResult<String> {
        self.queue
            .enqueue(request, priority, timeout_seconds, idempotency_key, user_id)
            .await
    }

    pub async fn queue_result(&self, id: &str) -> QueueResult<Option<QueueResultRecord>> {
        self.queue.get_result(id).await
    }

    /// Worker-pool entry point (spec §4.4, asynchronous path): blocking pop
    /// with a server-side timeout.
    pub async fn dequeue(&self, wait_seconds: u64, worker_id: &str) -> QueueResult<Option<QueueItem>> {
        self.queue.dequeue(wait_seconds, worker_id).await
    }

    /// Worker-pool entry point: publish a completed or failed result.
    pub async fn complete_queue_item(
        &self,
        item_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> QueueResult<()> {
        self.queue.complete(item_id, result, error).await
    }

    /// Comprehensive `/health` aggregation (SPEC_FULL §10), distinct from
    /// the liveness/readiness probes which `gateway-server` implements
    /// directly since they don't need every subsystem's state.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let kv_healthy = self.kv.ping().await.is_ok();
        let provider = self.provider.health().await;
        let queue = self
            .queue
            .stats()
            .await
            .unwrap_or(QueueStats {
                total: 0,
                pending_len: 0,
                processing_len: 0,
                completed: 0,
                failed: 0,
            });

        HealthSnapshot {
            kv_healthy,
            provider,
            queue,
        }
    }

    /// Non-consuming rate-limit peek, wired into the health aggregation
    /// and used directly by tests (boundary B1).
    pub async fn peek_rate_limit(&self, identifier: &str) -> (RateLimitDecision, RateLimitDecision) {
        self.rate_limiter.peek(identifier).await
    }

    /// Release upstream connections during graceful shutdown (spec §4.3
    /// `Provider::close`).
    pub async fn close_provider(&self) {
        self.provider.close().await
    }
}
