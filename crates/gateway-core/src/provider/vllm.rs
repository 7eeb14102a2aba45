//! Self-hosted, OpenAI-compatible adapter (spec §4.3), grounded on
//! `original_source/streamstack/providers/vllm_provider.py`.

use super::{with_unary_retries, ChatChunkStream, Provider, ProviderHealth, ProviderSettings, ProviderUsage};
use crate::error::{ProviderError, ProviderResult};
use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Default)]
struct UsageCounters {
    requests: AtomicU64,
    tokens_consumed: AtomicU64,
    sum_latency_millis: AtomicU64,
}

/// Adapter for a locally hosted, OpenAI-wire-compatible server (e.g.
/// vLLM). Cost is always reported as 0 (no billing to track); the model
/// list is refreshed from `/models` the first time it's needed, since
/// self-hosted deployments don't ship a static price table to enumerate.
pub struct VllmProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
    usage: UsageCounters,
    available_models: Mutex<Vec<String>>,
}

impl VllmProvider {
    pub fn new(settings: ProviderSettings) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(ProviderError::from)?;

        Ok(Self {
            client,
            settings,
            usage: UsageCounters::default(),
            available_models: Mutex::new(Vec::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn refresh_available_models(&self) {
        let Ok(response) = self.client.get(self.endpoint("/models")).send().await else {
            return;
        };
        if !response.status().is_success() {
            return;
        }
        let Ok(body) = response.json::<serde_json::Value>().await else {
            return;
        };
        if let Some(models) = body.get("data").and_then(|d| d.as_array()) {
            let names = models
                .iter()
                .filter_map(|m| m.get("id").and_then(|id| id.as_str()).map(str::to_string))
                .collect();
            *self.available_models.lock().unwrap() = names;
        }
    }

    async fn send_unary(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .json(request)
            .send()
            .await?;
        handle_response(response).await
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> ProviderResult<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(ProviderError::from);
    }

    if status.as_u16() == 503 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Unavailable {
            message: body,
            retry_after: 30,
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), body, None))
}

#[async_trait]
impl Provider for VllmProvider {
    fn name(&self) -> &str {
        "vllm"
    }

    fn supported_models(&self) -> Vec<String> {
        let models = self.available_models.lock().unwrap();
        if models.is_empty() {
            vec![self.settings.default_model.clone()]
        } else {
            models.clone()
        }
    }

    async fn validate_model(&self, model: &str) -> bool {
        if self.available_models.lock().unwrap().is_empty() {
            self.refresh_available_models().await;
        }
        self.supported_models().iter().any(|m| m == model)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn chat_completion(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        let start = Instant::now();
        let result = with_unary_retries(self.settings.max_retries, |_attempt| {
            self.send_unary(request)
        })
        .await;

        match &result {
            Ok(response) => {
                self.usage.requests.fetch_add(1, Ordering::Relaxed);
                self.usage
                    .tokens_consumed
                    .fetch_add(response.usage.total_tokens as u64, Ordering::Relaxed);
                self.usage
                    .sum_latency_millis
                    .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                info!(completion_id = %response.id, "chat completion successful");
            }
            Err(err) => warn!(error = %err, "chat completion failed"),
        }
        result
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn chat_completion_stream(&self, request: &ChatRequest) -> ProviderResult<ChatChunkStream> {
        let mut stream_request = request.clone();
        stream_request.stream = true;

        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .json(&stream_request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(handle_response::<ChatChunk>(response).await.unwrap_err());
        }

        Ok(super::sse::sse_chunk_stream(response.bytes_stream()).boxed())
    }

    async fn health(&self) -> ProviderHealth {
        let start = Instant::now();
        match self.client.get(self.endpoint("/models")).send().await {
            Ok(response) if response.status().is_success() => ProviderHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                error: None,
            },
            Ok(response) => ProviderHealth {
                healthy: false,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                error: Some(format!("HTTP {}", response.status())),
            },
            Err(err) => ProviderHealth {
                healthy: false,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                error: Some(err.to_string()),
            },
        }
    }

    async fn usage(&self) -> ProviderUsage {
        let requests = self.usage.requests.load(Ordering::Relaxed);
        ProviderUsage {
            requests,
            tokens_consumed: self.usage.tokens_consumed.load(Ordering::Relaxed),
            cost_usd: 0.0,
            sum_latency_seconds: self.usage.sum_latency_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn estimate_cost(&self, _request: &ChatRequest) -> f64 {
        0.0
    }

    async fn close(&self) {
        info!("vLLM provider closed");
    }
}
