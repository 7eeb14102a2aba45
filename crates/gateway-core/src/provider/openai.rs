//! OpenAI-compatible adapter (spec §4.3), grounded on
//! `original_source/streamstack/providers/openai_provider.py`.

use super::{
    with_unary_retries, ChatChunkStream, Provider, ProviderHealth, ProviderSettings, ProviderUsage,
};
use crate::error::{ProviderError, ProviderResult};
use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Per-model `(input_per_1k, output_per_1k)` USD pricing, copied verbatim
/// from the Python original's `MODEL_PRICING` table.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-3.5-turbo", 0.0015, 0.002),
    ("gpt-3.5-turbo-16k", 0.003, 0.004),
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-32k", 0.06, 0.12),
    ("gpt-4-turbo-preview", 0.01, 0.03),
    ("gpt-4-vision-preview", 0.01, 0.03),
];

fn pricing_for(model: &str) -> Option<(f64, f64)> {
    MODEL_PRICING
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| (*input, *output))
}

#[derive(Default)]
struct UsageCounters {
    requests: AtomicU64,
    tokens_consumed: AtomicU64,
    sum_latency_millis: AtomicU64,
    cost_usd: Mutex<f64>,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
    usage: UsageCounters,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings) -> ProviderResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Auth {
                message: "OpenAI API key is required".into(),
            })?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| ProviderError::Auth {
                    message: e.to_string(),
                })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(ProviderError::from)?;

        Ok(Self {
            client,
            settings,
            usage: UsageCounters::default(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn record_usage(&self, response: &ChatResponse, elapsed: std::time::Duration) {
        self.usage.requests.fetch_add(1, Ordering::Relaxed);
        self.usage
            .tokens_consumed
            .fetch_add(response.usage.total_tokens as u64, Ordering::Relaxed);
        self.usage
            .sum_latency_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);

        if let Some((input, output)) = pricing_for(&response.model) {
            let cost = (response.usage.prompt_tokens as f64 / 1000.0) * input
                + (response.usage.completion_tokens as f64 / 1000.0) * output;
            *self.usage.cost_usd.lock().unwrap() += cost;
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

/// Translate a non-2xx upstream response into the typed taxonomy (spec
/// §4.3 "Error taxonomy"), reading the `Retry-After` header for 429s.
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> ProviderResult<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(ProviderError::from);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), body, retry_after))
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supported_models(&self) -> Vec<String> {
        MODEL_PRICING.iter().map(|(name, _, _)| name.to_string()).collect()
    }

    async fn validate_model(&self, model: &str) -> bool {
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
                self.record_usage(response, start.elapsed());
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

        use futures::StreamExt;
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
            cost_usd: *self.usage.cost_usd.lock().unwrap(),
            sum_latency_seconds: self.usage.sum_latency_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        let Some((input, output)) = pricing_for(&request.model) else {
            return 0.0;
        };
        let prompt_tokens = request.estimate_prompt_tokens();
        let output_tokens = request.max_tokens_or_default();
        (prompt_tokens as f64 / 1000.0) * input + (output_tokens as f64 / 1000.0) * output
    }

    async fn close(&self) {
        info!("OpenAI provider closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_table_has_default_model() {
        assert!(pricing_for("gpt-3.5-turbo").is_some());
        assert!(pricing_for("not-a-model").is_none());
    }

    #[test]
    fn estimate_cost_matches_spec_formula() {
        let settings = ProviderSettings {
            base_url: "https://api.openai.com/v1".into(),
            api_key: Some("sk-test".into()),
            default_model: "gpt-3.5-turbo".into(),
            timeout: std::time::Duration::from_secs(60),
            max_retries: 3,
        };
        let provider = OpenAiProvider::new(settings).unwrap();
        let request = ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![crate::types::ChatMessage {
                role: crate::types::Role::User,
                content: "a".repeat(400),
                name: None,
            }],
            temperature: Some(0.7),
            max_tokens: Some(50),
            top_p: Some(1.0),
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            stream: false,
            user: None,
        };
        let cost = provider.estimate_cost(&request);
        // prompt_chars/4 = 100 tokens, input 0.0015/1k -> 0.00015
        // output 50 tokens, output 0.002/1k -> 0.0001
        assert!((cost - 0.00025).abs() < 1e-9);
    }
}
