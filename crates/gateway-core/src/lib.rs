//! Admission, queueing, rate-limiting, and provider-forwarding pipeline
//! for an LLM gateway. HTTP, CORS, logging initialization, and the
//! process entry point live in `gateway-server`; this crate has no
//! dependency on an HTTP framework.

pub mod config;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod types;

pub use config::Config;
pub use gateway::{Gateway, HealthSnapshot};
pub use kv::{KvStore, RedisKv};
pub use provider::{OpenAiProvider, Provider, VllmProvider};
pub use queue::{Queue, QueueConfig, QueueItem, QueueStats};
pub use rate_limiter::{Dimension, RateLimitDecision, RateLimiter, RateLimiterConfig};
