//! Provider abstraction for upstream LLM backends (spec §4.3).

pub mod openai;
mod sse;
pub mod vllm;

pub use openai::OpenAiProvider;
pub use vllm::VllmProvider;

use crate::error::ProviderResult;
use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Result of a [`Provider::health`] call.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

/// Monotonically increasing per-process counters (spec §3 `ProviderUsage`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderUsage {
    pub requests: u64,
    pub tokens_consumed: u64,
    pub cost_usd: f64,
    pub sum_latency_seconds: f64,
}

impl ProviderUsage {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.sum_latency_seconds / self.requests as f64) * 1000.0
        }
    }
}

/// Common retry/timeout knobs for provider adapters (spec §4.3, §5
/// "Timeouts").
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// A finite, cancellable stream of chat chunks. Dropping it aborts the
/// underlying upstream call (spec §5 "Cancellation").
pub type ChatChunkStream = BoxStream<'static, ProviderResult<ChatChunk>>;

/// Capability interface for an LLM backend (spec §4.3).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supported_models(&self) -> Vec<String>;

    async fn validate_model(&self, model: &str) -> bool;

    /// Unary completion. Implementations retry on `Timeout` and on
    /// connect/unexpected errors up to `max_retries` with exponential
    /// backoff; never on `RateLimit`, `Auth`, or `NotFound`.
    async fn chat_completion(&self, request: &ChatRequest) -> ProviderResult<ChatResponse>;

    /// Streaming completion. Never retried (spec §4.3 "Retry policy":
    /// partial output may already have been emitted).
    async fn chat_completion_stream(&self, request: &ChatRequest) -> ProviderResult<ChatChunkStream>;

    async fn health(&self) -> ProviderHealth;

    async fn usage(&self) -> ProviderUsage;

    /// `(prompt_chars/4)/1000 * input_per_1k + (max_tokens or 100)/1000 *
    /// output_per_1k` (spec §4.3 "Cost estimation"). Self-hosted adapters
    /// return 0.
    fn estimate_cost(&self, request: &ChatRequest) -> f64;

    async fn close(&self);
}

/// Retry on these, per spec §4.3's retry policy, for unary calls only.
pub(crate) fn is_retryable(err: &crate::error::ProviderError) -> bool {
    matches!(
        err,
        crate::error::ProviderError::Timeout { .. } | crate::error::ProviderError::Generic { .. }
    )
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// Shared unary retry loop: exponential backoff `2^attempt` seconds, up to
/// `max_retries`, retrying only [`is_retryable`] errors (spec §4.3 "Retry
/// policy"). Never used for streaming calls.
pub(crate) async fn with_unary_retries<F, Fut, T>(max_retries: u32, mut attempt_fn: F) -> ProviderResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries && is_retryable(&err) => {
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
