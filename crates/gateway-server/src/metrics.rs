//! Prometheus scrape endpoint plumbing (SPEC_FULL §9.5), grounded on the
//! sibling gateway repos' `metrics` + `metrics-exporter-prometheus` usage
//! (`other_examples/.../secure-llm-gateway__src-main.rs.rs`).

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Counter/histogram call sites recovering
/// `streamstack.observability.metrics`'s per-provider tracking hooks.
/// Queue-depth gauging (`update_queue_depth`) lives in
/// `gateway_core::queue::Queue::stats`, which owns the pending/processing
/// counts directly and gauges them without needing a server-side wrapper.
pub fn record_request(provider: &str, outcome: &'static str) {
    metrics::counter!("gateway_provider_requests_total", "provider" => provider.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_latency(provider: &str, seconds: f64) {
    metrics::histogram!("gateway_provider_request_duration_seconds", "provider" => provider.to_string())
        .record(seconds);
}
