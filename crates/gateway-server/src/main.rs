//! Process entry point: load config, wire up the KV client, rate limiter,
//! queue, and active provider, then serve the axum app (spec §4.4, §9).

mod app;
mod http_error;
mod logging;
mod metrics;
mod request_context;
mod routes;
mod shutdown;
mod state;
mod worker;

use gateway_core::config::ProviderKind;
use gateway_core::provider::{OpenAiProvider, ProviderSettings, VllmProvider};
use gateway_core::{Config, Gateway, Provider, Queue, QueueConfig, RateLimiter, RateLimiterConfig, RedisKv};
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::load());
    logging::init_tracing(&config.logging);

    let metrics_handle = metrics::install_recorder().expect("failed to install metrics recorder");

    let kv = Arc::new(
        RedisKv::connect(&config.kv.kv_url)
            .await
            .expect("failed to connect to key-value store"),
    );

    let rate_limiter = RateLimiter::new(
        kv.clone(),
        RateLimiterConfig {
            requests_per_minute: config.rate_limit.requests_per_minute,
            tokens_per_minute: config.rate_limit.tokens_per_minute,
            burst_size: config.rate_limit.burst_size,
        },
    );

    let queue = Arc::new(Queue::new(
        "default",
        kv.clone(),
        QueueConfig {
            max_size: config.queue.max_queue_size,
            default_timeout_seconds: config.queue.request_timeout_seconds,
            cleanup_interval_seconds: config.queue.cleanup_interval_seconds,
        },
    ));
    let cleanup_handle = queue.spawn_cleanup_task();

    let provider: Arc<dyn Provider> = build_provider(&config);

    let gateway = Arc::new(Gateway::new(kv, rate_limiter, queue, provider));

    let worker_handles = if config.queue.async_mode_enabled {
        tracing::info!(workers = config.queue.worker_count, "starting queue worker pool");
        worker::spawn_workers(gateway.clone(), config.queue.worker_count)
    } else {
        Vec::new()
    };

    let state = AppState {
        gateway: gateway.clone(),
        config: config.clone(),
        metrics_handle,
    };

    let router = app::build_router(state);
    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .expect("invalid bind address");

    tracing::info!(%addr, "gateway-server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown::shutdown_signal())
    .await
    .expect("server error");

    cleanup_handle.abort();
    for handle in worker_handles {
        handle.abort();
    }
    gateway.close_provider().await;
}

fn build_provider(config: &Config) -> Arc<dyn Provider> {
    let settings = ProviderSettings {
        base_url: config.provider.base_url.to_string(),
        api_key: config.provider.api_key.clone(),
        default_model: config.provider.default_model.to_string(),
        timeout: Duration::from_secs(config.provider.timeout_seconds),
        max_retries: config.provider.max_retries,
    };

    match config.provider.kind {
        ProviderKind::Openai => {
            Arc::new(OpenAiProvider::new(settings).expect("failed to build OpenAI provider"))
        }
        ProviderKind::Vllm => {
            Arc::new(VllmProvider::new(settings).expect("failed to build vLLM provider"))
        }
    }
}
