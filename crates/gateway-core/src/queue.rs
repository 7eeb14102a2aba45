//! Bounded, priority-aware, idempotent request queue (spec §4.2).
//!
//! Grounded on `original_source/streamstack/queue/manager.py`'s
//! `RedisQueue`: same key scheme (`queue:{name}:pending|processing|
//! results|stats|idempotency`), same enqueue/dequeue/complete semantics,
//! reimplemented against [`KvStore`] instead of `redis.asyncio` directly.

use crate::error::{QueueError, QueueResult};
use crate::types::ChatRequest;
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{interval, Duration};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const RESULT_RETENTION_SECS: u64 = 600;

/// A single queued chat request (spec §3 `QueueItem`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub request: ChatRequest,
    pub priority: i32,
    pub created_at: i64,
    pub user_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub timeout_seconds: i64,
}

impl QueueItem {
    pub fn is_expired(&self, now: i64) -> bool {
        self.created_at + self.timeout_seconds < now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessingEntry {
    item: QueueItem,
    started_at: i64,
    worker_id: String,
}

/// Result of a completed item, published under `Q:results:{id}` (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueResultRecord {
    pub item_id: String,
    pub completed_at: i64,
    pub processing_time_secs: f64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub success: bool,
}

/// Snapshot of `Q:stats` plus live pending/processing lengths (spec §4.2
/// `stats()`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: i64,
    pub pending_len: i64,
    pub processing_len: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_size: i64,
    pub default_timeout_seconds: i64,
    pub cleanup_interval_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_timeout_seconds: 300,
            cleanup_interval_seconds: 60,
        }
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// A named bounded queue backed by a shared [`KvStore`].
pub struct Queue {
    name: String,
    kv: Arc<dyn KvStore>,
    config: QueueConfig,
    pending_key: String,
    processing_key: String,
    results_prefix: String,
    stats_key: String,
    idempotency_prefix: String,
}

impl Queue {
    pub fn new(name: impl Into<String>, kv: Arc<dyn KvStore>, config: QueueConfig) -> Self {
        let name = name.into();
        Self {
            pending_key: format!("queue:{name}:pending"),
            processing_key: format!("queue:{name}:processing"),
            results_prefix: format!("queue:{name}:results"),
            stats_key: format!("queue:{name}:stats"),
            idempotency_prefix: format!("queue:{name}:idempotency"),
            name,
            kv,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:{}", self.idempotency_prefix, key)
    }

    fn result_key(&self, id: &str) -> String {
        format!("{}:{}", self.results_prefix, id)
    }

    /// Admit a request onto the queue. Returns the existing id without
    /// re-enqueueing when `idempotency_key` already maps to a live item
    /// (spec §4.2, invariant ii).
    #[instrument(skip(self, request), fields(queue = %self.name, priority))]
    pub async fn enqueue(
        &self,
        request: ChatRequest,
        priority: i32,
        timeout_seconds: Option<i64>,
        idempotency_key: Option<String>,
        user_id: Option<String>,
    ) -> QueueResult<String> {
        if let Some(key) = &idempotency_key {
            if let Some(existing_id) = self.kv.get(&self.idempotency_key(key)).await? {
                info!(idempotency_key = %key, item_id = %existing_id, "duplicate request, returning existing id");
                return Ok(existing_id);
            }
        }

        let mut current_size = self.kv.llen(&self.pending_key).await?;
        if current_size >= self.config.max_size {
            self.evict_expired().await?;
            current_size = self.kv.llen(&self.pending_key).await?;
            if current_size >= self.config.max_size {
                warn!(queue = %self.name, size = current_size, "queue is full");
                return Err(QueueError::Full(self.name.clone()));
            }
        }

        let timeout_seconds = timeout_seconds.unwrap_or(self.config.default_timeout_seconds);
        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            request,
            priority,
            created_at: now_epoch(),
            user_id,
            idempotency_key: idempotency_key.clone(),
            timeout_seconds,
        };
        let serialized = serde_json::to_string(&item)?;

        if priority > 0 {
            self.kv.lpush(&self.pending_key, &serialized).await?;
        } else {
            self.kv.rpush(&self.pending_key, &serialized).await?;
        }

        if let Some(key) = &idempotency_key {
            self.kv
                .setex(&self.idempotency_key(key), timeout_seconds as u64, &item.id)
                .await?;
        }

        self.kv.hincrby(&self.stats_key, "total", 1).await?;

        info!(item_id = %item.id, priority, "item enqueued");
        Ok(item.id)
    }

    /// Blocking left-pop with a server-side timeout; records a processing
    /// lease on success. Returns `None` on timeout (spec §4.2).
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn dequeue(&self, wait_seconds: u64, worker_id: &str) -> QueueResult<Option<QueueItem>> {
        let raw = match self.kv.blpop(&self.pending_key, wait_seconds).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "dequeue failed");
                return Ok(None);
            }
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        let item: QueueItem = serde_json::from_str(&raw)?;
        let entry = ProcessingEntry {
            item: item.clone(),
            started_at: now_epoch(),
            worker_id: worker_id.to_string(),
        };
        let serialized = serde_json::to_string(&entry)?;
        self.kv
            .hset(&self.processing_key, &item.id, &serialized)
            .await?;

        info!(item_id = %item.id, "item dequeued");
        Ok(Some(item))
    }

    /// Mark an item completed or failed. Idempotent: a missing processing
    /// entry is logged and silently accepted (spec §4.2, R2).
    #[instrument(skip(self, result, error), fields(queue = %self.name, item_id))]
    pub async fn complete(
        &self,
        item_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> QueueResult<()> {
        let Some(raw) = self.kv.hget(&self.processing_key, item_id).await? else {
            warn!(item_id, "item not found in processing, treating complete as a no-op");
            return Ok(());
        };
        let entry: ProcessingEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(item_id, error = %err, "malformed processing entry, discarding");
                self.kv.hdel(&self.processing_key, item_id).await?;
                return Ok(());
            }
        };

        let now = now_epoch();
        let record = QueueResultRecord {
            item_id: item_id.to_string(),
            completed_at: now,
            processing_time_secs: (now - entry.started_at) as f64,
            result,
            error: error.clone(),
            success: error.is_none(),
        };

        self.kv.hdel(&self.processing_key, item_id).await?;
        self.kv
            .setex(
                &self.result_key(item_id),
                RESULT_RETENTION_SECS,
                &serde_json::to_string(&record)?,
            )
            .await?;

        if error.is_some() {
            self.kv.hincrby(&self.stats_key, "failed", 1).await?;
        } else {
            self.kv.hincrby(&self.stats_key, "completed", 1).await?;
        }

        info!(item_id, success = record.success, "item completed");
        Ok(())
    }

    pub async fn get_result(&self, item_id: &str) -> QueueResult<Option<QueueResultRecord>> {
        let Some(raw) = self.kv.get(&self.result_key(item_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let counters = self.kv.hgetall(&self.stats_key).await?;
        let pending_len = self.kv.llen(&self.pending_key).await?;
        let processing_len = self.kv.hlen(&self.processing_key).await?;

        let get = |field: &str| -> i64 {
            counters
                .get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        metrics::gauge!("gateway_queue_pending", "queue" => self.name.clone()).set(pending_len as f64);
        metrics::gauge!("gateway_queue_processing", "queue" => self.name.clone()).set(processing_len as f64);

        Ok(QueueStats {
            total: get("total"),
            pending_len,
            processing_len,
            completed: get("completed"),
            failed: get("failed"),
        })
    }

    /// Remove processing entries whose item has expired. Best-effort,
    /// single-shot; races with [`Queue::complete`] are benign because both
    /// remove from the processing map (spec §4.2 "Cleanup daemon").
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn evict_expired(&self) -> QueueResult<usize> {
        let now = now_epoch();
        let processing = self.kv.hgetall(&self.processing_key).await?;
        let mut removed = 0usize;

        for (item_id, raw) in processing {
            match serde_json::from_str::<ProcessingEntry>(&raw) {
                Ok(entry) if entry.item.is_expired(now) => {
                    self.kv.hdel(&self.processing_key, &item_id).await?;
                    removed += 1;
                    warn!(item_id, "expired processing item removed");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(item_id, error = %err, "invalid processing entry, discarding");
                    self.kv.hdel(&self.processing_key, &item_id).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "cleanup completed");
        }
        Ok(removed)
    }

    /// Spawn the periodic cleanup daemon. The returned handle should be
    /// aborted on shutdown.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut ticker = interval(Duration::from_secs(queue.config.cleanup_interval_seconds));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match queue.evict_expired().await {
                    Ok(removed) if removed > 0 => {
                        metrics::counter!("gateway_queue_expired_total", "queue" => queue.name.clone())
                            .increment(removed as u64);
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "cleanup loop error"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KvResult;
    use crate::kv::TokenBucketOutcome;
    use crate::types::{ChatMessage, Role};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MemoryKv {
        lists: AsyncMutex<HashMap<String, Vec<String>>>,
        hashes: AsyncMutex<HashMap<String, HashMap<String, String>>>,
        strings: AsyncMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl KvStore for MemoryKv {
        async fn eval_token_bucket(
            &self,
            _key: &str,
            _capacity: f64,
            _refill_rate: f64,
            _refill_period: i64,
            _requested: f64,
            _now: i64,
        ) -> KvResult<TokenBucketOutcome> {
            unimplemented!()
        }

        async fn lpush(&self, key: &str, value: &str) -> KvResult<()> {
            self.lists
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .insert(0, value.to_string());
            Ok(())
        }

        async fn rpush(&self, key: &str, value: &str) -> KvResult<()> {
            self.lists
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        }

        async fn blpop(&self, key: &str, _timeout_secs: u64) -> KvResult<Option<String>> {
            let mut lists = self.lists.lock().await;
            let Some(list) = lists.get_mut(key) else {
                return Ok(None);
            };
            if list.is_empty() {
                Ok(None)
            } else {
                Ok(Some(list.remove(0)))
            }
        }

        async fn llen(&self, key: &str) -> KvResult<i64> {
            Ok(self
                .lists
                .lock()
                .await
                .get(key)
                .map(|l| l.len() as i64)
                .unwrap_or(0))
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
            self.hashes
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
            Ok(())
        }

        async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
            Ok(self
                .hashes
                .lock()
                .await
                .get(key)
                .and_then(|h| h.get(field).cloned()))
        }

        async fn hdel(&self, key: &str, field: &str) -> KvResult<()> {
            if let Some(h) = self.hashes.lock().await.get_mut(key) {
                h.remove(field);
            }
            Ok(())
        }

        async fn hlen(&self, key: &str) -> KvResult<i64> {
            Ok(self
                .hashes
                .lock()
                .await
                .get(key)
                .map(|h| h.len() as i64)
                .unwrap_or(0))
        }

        async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
            Ok(self.hashes.lock().await.get(key).cloned().unwrap_or_default())
        }

        async fn hincrby(&self, key: &str, field: &str, by: i64) -> KvResult<i64> {
            let mut hashes = self.hashes.lock().await;
            let h = hashes.entry(key.to_string()).or_default();
            let current: i64 = h.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
            let new_value = current + by;
            h.insert(field.to_string(), new_value.to_string());
            Ok(new_value)
        }

        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            Ok(self.strings.lock().await.get(key).cloned())
        }

        async fn setex(&self, key: &str, _ttl_secs: u64, value: &str) -> KvResult<()> {
            self.strings
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn expire(&self, _key: &str, _ttl_secs: u64) -> KvResult<()> {
            Ok(())
        }

        async fn del(&self, key: &str) -> KvResult<()> {
            self.strings.lock().await.remove(key);
            Ok(())
        }

        async fn ping(&self) -> KvResult<()> {
            Ok(())
        }
    }

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Hi".into(),
                name: None,
            }],
            temperature: Some(0.7),
            max_tokens: None,
            top_p: Some(1.0),
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            stream: false,
            user: None,
        }
    }

    fn queue() -> Queue {
        Queue::new(
            "default",
            Arc::new(MemoryKv::default()),
            QueueConfig {
                max_size: 2,
                default_timeout_seconds: 300,
                cleanup_interval_seconds: 60,
            },
        )
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete_round_trip() {
        let q = queue();
        let id = q
            .enqueue(sample_request(), 0, None, None, None)
            .await
            .unwrap();

        let item = q.dequeue(1, "worker-1").await.unwrap().unwrap();
        assert_eq!(item.id, id);

        q.complete(&id, Some(serde_json::json!({"ok": true})), None)
            .await
            .unwrap();

        let result = q.get_result(&id).await.unwrap().unwrap();
        assert!(result.success);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_existing_id() {
        let q = queue();
        let id1 = q
            .enqueue(
                sample_request(),
                0,
                None,
                Some("k1".to_string()),
                None,
            )
            .await
            .unwrap();
        let id2 = q
            .enqueue(
                sample_request(),
                0,
                None,
                Some("k1".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn queue_full_when_at_capacity_with_no_expired_items() {
        let q = queue();
        q.enqueue(sample_request(), 0, None, Some("a".into()), None)
            .await
            .unwrap();
        q.enqueue(sample_request(), 0, None, Some("b".into()), None)
            .await
            .unwrap();

        let err = q
            .enqueue(sample_request(), 0, None, Some("c".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full(_)));
    }

    #[tokio::test]
    async fn expired_processing_entry_is_evicted_and_complete_is_a_no_op() {
        let q = queue();
        let id = q
            .enqueue(sample_request(), 0, Some(1), None, None)
            .await
            .unwrap();
        q.dequeue(1, "worker-1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let removed = q.evict_expired().await.unwrap();
        assert_eq!(removed, 1);

        q.complete(&id, Some(serde_json::json!({})), None)
            .await
            .unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn priority_item_head_jumps_fifo() {
        let q = queue();
        let low = q
            .enqueue(sample_request(), 0, None, None, None)
            .await
            .unwrap();
        let high = q
            .enqueue(sample_request(), 1, None, None, None)
            .await
            .unwrap();

        let first = q.dequeue(1, "worker-1").await.unwrap().unwrap();
        assert_eq!(first.id, high);
        let second = q.dequeue(1, "worker-1").await.unwrap().unwrap();
        assert_eq!(second.id, low);
    }
}
