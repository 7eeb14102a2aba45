//! Key-value client abstraction (spec §6 "KV store required operations").
//!
//! `gateway-core` never talks to Redis directly outside this module; the
//! rate limiter and queue are written against [`KvStore`] so a different
//! backend can be swapped in behind the trait.

mod redis_store;

pub use redis_store::RedisKv;

use crate::error::KvResult;
use async_trait::async_trait;
use std::collections::HashMap;

/// Outcome of the atomic token-bucket script (spec §4.1 "Algorithm").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    pub allowed: bool,
    pub remaining: f64,
    pub reset_at: i64,
    pub retry_after: i64,
}

/// Thin asynchronous client over a shared key-value store.
///
/// Mirrors the operations spec.md §6 names verbatim: atomic scripting,
/// list push/pop, hash access, string get/setex, expire, ping. Every method
/// takes owned/borrowed primitives only so the trait stays object-safe.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Run the token-bucket algorithm atomically against `key`, per the
    /// exact semantics of spec.md §4.1's "Algorithm (atomic script)".
    async fn eval_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        refill_period: i64,
        requested: f64,
        now: i64,
    ) -> KvResult<TokenBucketOutcome>;

    async fn lpush(&self, key: &str, value: &str) -> KvResult<()>;
    async fn rpush(&self, key: &str, value: &str) -> KvResult<()>;
    /// Blocking left-pop with a server-side timeout. `None` on timeout.
    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>>;
    async fn llen(&self, key: &str) -> KvResult<i64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<()>;
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    async fn hdel(&self, key: &str, field: &str) -> KvResult<()>;
    async fn hlen(&self, key: &str) -> KvResult<i64>;
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;
    /// Atomic `HINCRBY`, used for the queue's `Q:stats` counters.
    async fn hincrby(&self, key: &str, field: &str, by: i64) -> KvResult<i64>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> KvResult<()>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<()>;
    async fn del(&self, key: &str) -> KvResult<()>;

    async fn ping(&self) -> KvResult<()>;
}
