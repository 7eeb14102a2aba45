use super::{KvStore, TokenBucketOutcome};
use crate::error::{KvError, KvResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::{instrument, warn};

/// Lua script implementing spec.md §4.1's token bucket algorithm.
///
/// Grounded on `original_source/streamstack/queue/rate_limiter.py`'s
/// `TokenBucket.lua_script`, translated line for line: read `(tokens,
/// last_refill)` from a hash, default to `(capacity, now)` on absence,
/// apply elapsed-period refill, then admit or deny `requested` tokens.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local refill_period = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local now = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1])
local last_refill = tonumber(bucket[2])

if tokens == nil then
    tokens = capacity
    last_refill = now
end

local time_elapsed = now - last_refill
local periods_elapsed = math.floor(time_elapsed / refill_period)

if periods_elapsed > 0 then
    tokens = math.min(capacity, tokens + (periods_elapsed * refill_rate))
    last_refill = last_refill + (periods_elapsed * refill_period)
end

local allowed = 0
local retry_after = 0

if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
else
    local tokens_needed = requested - tokens
    local periods_needed = math.ceil(tokens_needed / refill_rate)
    retry_after = periods_needed * refill_period
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('EXPIRE', key, refill_period * 2)

local reset_time = last_refill + refill_period

return {allowed, tostring(tokens), reset_time, retry_after}
"#;

/// Redis-backed [`KvStore`] adapter.
pub struct RedisKv {
    conn: ConnectionManager,
    script: Script,
}

impl RedisKv {
    /// Connect to `url` and verify the connection with a `PING`.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(KvError::Command)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(KvError::Command)?;
        let store = Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        };
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    #[instrument(skip(self), level = "debug")]
    async fn eval_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        refill_period: i64,
        requested: f64,
        now: i64,
    ) -> KvResult<TokenBucketOutcome> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, reset_at, retry_after): (i64, String, i64, i64) = self
            .script
            .key(key)
            .arg(capacity)
            .arg(refill_rate)
            .arg(refill_period)
            .arg(requested)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(KvError::Command)?;

        let remaining: f64 = remaining.parse().unwrap_or(capacity);
        Ok(TokenBucketOutcome {
            allowed: allowed == 1,
            remaining,
            reset_at,
            retry_after,
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value)
            .await
            .map_err(KvError::Command)
    }

    async fn rpush(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value)
            .await
            .map_err(KvError::Command)
    }

    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .blpop(key, timeout_secs as f64)
            .await
            .map_err(KvError::Command)?;
        Ok(result.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(KvError::Command)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(KvError::Command)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(KvError::Command)
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field)
            .await
            .map_err(KvError::Command)
    }

    async fn hlen(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.hlen(key).await.map_err(KvError::Command)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(KvError::Command)
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(key, field, by).await.map_err(KvError::Command)
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(KvError::Command)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(KvError::Command)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(KvError::Command)
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(KvError::Command)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(KvError::Command)?;
        if pong != "PONG" {
            warn!(response = %pong, "unexpected PING response");
        }
        Ok(())
    }
}
