//! Distributed token-bucket rate limiting (spec §4.1).
//!
//! Unlike the teacher's `LockFreeTokenBucket`, which keeps bucket state in
//! process-local atomics, this limiter must be correct across many gateway
//! processes sharing one KV store, so all state lives behind
//! [`KvStore::eval_token_bucket`] and every check is a single atomic script
//! invocation (Design Notes §9, "Atomic distributed state").

use crate::error::KvError;
use crate::kv::KvStore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{instrument, warn};

/// Which bucket a check consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Requests,
    Tokens,
}

impl Dimension {
    fn as_str(self) -> &'static str {
        match self {
            Dimension::Requests => "requests",
            Dimension::Tokens => "tokens",
        }
    }
}

/// Outcome of a [`RateLimiter::check`] or [`RateLimiter::check_both`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub reset_at: i64,
    pub retry_after: Option<i64>,
}

impl RateLimitDecision {
    fn fail_open(capacity: f64, now: i64, refill_period: i64) -> Self {
        Self {
            allowed: true,
            remaining: capacity,
            reset_at: now + refill_period,
            retry_after: None,
        }
    }
}

/// Per-identifier limits for one dimension: capacity includes burst,
/// refill happens once per `refill_period` seconds.
#[derive(Debug, Clone, Copy)]
struct BucketLimits {
    capacity: f64,
    refill_rate: f64,
    refill_period: i64,
}

/// Configuration for a [`RateLimiter`] (spec §4.1 "Dimensions and defaults").
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 90_000,
            burst_size: 10,
        }
    }
}

/// Multi-dimensional rate limiter backed by a shared [`KvStore`].
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    requests: BucketLimits,
    tokens: BucketLimits,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimiterConfig) -> Self {
        Self {
            kv,
            requests: BucketLimits {
                capacity: (config.requests_per_minute + config.burst_size) as f64,
                refill_rate: config.requests_per_minute as f64,
                refill_period: 60,
            },
            tokens: BucketLimits {
                capacity: (config.tokens_per_minute + config.burst_size * 100) as f64,
                refill_rate: config.tokens_per_minute as f64,
                refill_period: 60,
            },
        }
    }

    fn limits_for(&self, dimension: Dimension) -> BucketLimits {
        match dimension {
            Dimension::Requests => self.requests,
            Dimension::Tokens => self.tokens,
        }
    }

    fn key_for(identifier: &str, dimension: Dimension) -> String {
        format!("rate_limit:{}:{}", dimension.as_str(), identifier)
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }

    /// Consume `n` tokens from `dimension`'s bucket for `identifier`. `n =
    /// 0` is a legal peek (B1: never denies on a fresh bucket).
    ///
    /// KV failures fail open per spec.md §4.1 "Failure semantics" — a
    /// deliberate availability-over-fairness choice.
    #[instrument(skip(self), fields(identifier, dimension = ?dimension, n))]
    pub async fn check(&self, identifier: &str, dimension: Dimension, n: f64) -> RateLimitDecision {
        let limits = self.limits_for(dimension);
        let key = Self::key_for(identifier, dimension);
        let now = Self::now();

        match self
            .kv
            .eval_token_bucket(
                &key,
                limits.capacity,
                limits.refill_rate,
                limits.refill_period,
                n,
                now,
            )
            .await
        {
            Ok(outcome) => RateLimitDecision {
                allowed: outcome.allowed,
                remaining: outcome.remaining,
                reset_at: outcome.reset_at,
                retry_after: if outcome.retry_after > 0 {
                    Some(outcome.retry_after)
                } else {
                    None
                },
            },
            Err(err) => {
                warn_kv_failure(&err, identifier, dimension);
                RateLimitDecision::fail_open(limits.capacity, now, limits.refill_period)
            }
        }
    }

    /// Check the `requests` dimension with n=1, then `tokens` with
    /// `n_tokens_estimate`; fail on the first denial (spec §4.1
    /// `check_both`). The requests check strictly precedes the tokens
    /// check (§5 "Ordering guarantees").
    #[instrument(skip(self), fields(identifier, n_tokens_estimate))]
    pub async fn check_both(&self, identifier: &str, n_tokens_estimate: f64) -> RateLimitDecision {
        let request_result = self.check(identifier, Dimension::Requests, 1.0).await;
        if !request_result.allowed {
            return request_result;
        }

        let token_result = self
            .check(identifier, Dimension::Tokens, n_tokens_estimate)
            .await;
        if !token_result.allowed {
            return token_result;
        }

        let per_request_tokens = if n_tokens_estimate > 0.0 {
            n_tokens_estimate
        } else {
            1.0
        };
        RateLimitDecision {
            allowed: true,
            remaining: request_result
                .remaining
                .min(token_result.remaining / per_request_tokens),
            reset_at: request_result.reset_at.max(token_result.reset_at),
            retry_after: None,
        }
    }

    /// Non-consuming peek at both dimensions, recovered from
    /// `get_limits_info` in the Python original (supplemented feature,
    /// SPEC_FULL §10).
    pub async fn peek(&self, identifier: &str) -> (RateLimitDecision, RateLimitDecision) {
        let requests = self.check(identifier, Dimension::Requests, 0.0).await;
        let tokens = self.check(identifier, Dimension::Tokens, 0.0).await;
        (requests, tokens)
    }
}

fn warn_kv_failure(err: &KvError, identifier: &str, dimension: Dimension) {
    warn!(
        identifier,
        dimension = dimension.as_str(),
        error = %err,
        "rate limit check failed against KV store, failing open"
    );
}
