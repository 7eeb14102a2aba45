//! Worker pool draining the queue in asynchronous mode (spec §4.4, "The
//! queue is used when ..."), grounded on
//! `original_source/streamstack/workers/pool.py`'s dequeue/dispatch/complete
//! loop.

use gateway_core::Gateway;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

const DEQUEUE_WAIT_SECONDS: u64 = 5;

/// Spawn `worker_count` tasks, each looping: blocking dequeue, dispatch to
/// the active provider, publish the result. Returns the join handles so
/// the caller can abort them on shutdown.
pub fn spawn_workers(gateway: Arc<Gateway>, worker_count: usize) -> Vec<JoinHandle<()>> {
    (0..worker_count)
        .map(|index| {
            let gateway = Arc::clone(&gateway);
            let worker_id = format!("worker-{index}");
            tokio::spawn(async move { run_worker(gateway, worker_id).await })
        })
        .collect()
}

async fn run_worker(gateway: Arc<Gateway>, worker_id: String) {
    let provider = gateway.provider_name().to_string();
    loop {
        let item = match gateway.dequeue(DEQUEUE_WAIT_SECONDS, &worker_id).await {
            Ok(Some(item)) => item,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(worker_id, error = %err, "dequeue failed");
                continue;
            }
        };

        let started = Instant::now();
        let (result, error) = match gateway.chat_completion(&item.request).await {
            Ok(response) => (serde_json::to_value(&response).ok(), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let outcome = if error.is_none() { "success" } else { "error" };
        crate::metrics::record_request(&provider, outcome);
        crate::metrics::record_latency(&provider, started.elapsed().as_secs_f64());

        if let Err(err) = gateway.complete_queue_item(&item.id, result, error).await {
            tracing::warn!(worker_id, item_id = %item.id, error = %err, "failed to publish queue result");
        }
    }
}
