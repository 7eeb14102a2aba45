//! Layered configuration (SPEC_FULL §9.3), grounded on
//! `vkteams-bot::config::types`'s per-field `default_xxx()` style, minus
//! its module-level `Lazy<CONFIG>` singleton: the Design Notes call for
//! re-architecting module-level singletons into explicit dependency
//! objects, so [`Config`] is built once in `gateway-server::main` and
//! threaded through as `Arc<Config>`.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub static APP_NAME: &str = "GATEWAY_CONFIG";
const ENV_PREFIX: &str = "GATEWAY_";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub kv: KvSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            rate_limit: RateLimitSettings::default(),
            kv: KvSettings::default(),
            provider: ProviderSettings::default(),
            logging: LoggingSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct QueueSettings {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: i64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: i64,
    #[serde(default = "default_queue_check_interval_seconds")]
    pub queue_check_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Per Design Note §9(a): asynchronous delivery is optional
    /// infrastructure, not the default request path.
    #[serde(default)]
    pub async_mode_enabled: bool,
    /// Worker pool size when `async_mode_enabled` is set; unused otherwise.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            request_timeout_seconds: default_request_timeout_seconds(),
            queue_check_interval_seconds: default_queue_check_interval_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            async_mode_enabled: false,
            worker_count: default_worker_count(),
        }
    }
}

fn default_max_queue_size() -> i64 {
    1000
}
fn default_request_timeout_seconds() -> i64 {
    300
}
fn default_queue_check_interval_seconds() -> u64 {
    10
}
fn default_worker_count() -> usize {
    4
}
fn default_cleanup_interval_seconds() -> u64 {
    60
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            burst_size: default_burst_size(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    60
}
fn default_tokens_per_minute() -> u32 {
    90_000
}
fn default_burst_size() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct KvSettings {
    #[serde(default = "default_kv_url")]
    pub kv_url: Cow<'static, str>,
    #[serde(default = "default_kv_max_connections")]
    pub kv_max_connections: u32,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            kv_url: default_kv_url(),
            kv_max_connections: default_kv_max_connections(),
        }
    }
}

fn default_kv_url() -> Cow<'static, str> {
    Cow::Borrowed("redis://127.0.0.1:6379")
}
fn default_kv_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Openai,
    Vllm,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderSettings {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: Cow<'static, str>,
    #[serde(default = "default_model")]
    pub default_model: Cow<'static, str>,
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            api_key: None,
            base_url: default_base_url(),
            default_model: default_model(),
            timeout_seconds: default_provider_timeout_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_url() -> Cow<'static, str> {
    Cow::Borrowed("https://api.openai.com/v1")
}
fn default_model() -> Cow<'static, str> {
    Cow::Borrowed("gpt-3.5-turbo")
}
fn default_provider_timeout_seconds() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Full,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct LoggingSettings {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub log_filter: Cow<'static, str>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> Cow<'static, str> {
    Cow::Borrowed("info")
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: Cow<'static, str>,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: Cow<'static, str>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_origins: default_cors_origins(),
            metrics_path: default_metrics_path(),
        }
    }
}

fn default_bind_addr() -> Cow<'static, str> {
    Cow::Borrowed("0.0.0.0:8080")
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_metrics_path() -> Cow<'static, str> {
    Cow::Borrowed("/metrics")
}

impl Config {
    /// Load from `.config/{GATEWAY_CONFIG}.toml` if the env var pointing
    /// at it is set, falling back to defaults on any failure (recovering
    /// `vkteams-bot::config::Config::new`'s fallback behavior), then apply
    /// `GATEWAY_`-prefixed environment overrides on top.
    pub fn load() -> Self {
        let mut config = match read_config_file() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read config from file, using defaults");
                Config::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}KV_URL")) {
            self.kv.kv_url = Cow::Owned(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}PROVIDER_API_KEY")) {
            self.provider.api_key = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}PROVIDER_BASE_URL")) {
            self.provider.base_url = Cow::Owned(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MAX_QUEUE_SIZE")) {
            if let Ok(v) = v.parse() {
                self.queue.max_queue_size = v;
            }
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}RATE_LIMIT_REQUESTS_PER_MINUTE")) {
            if let Ok(v) = v.parse() {
                self.rate_limit.requests_per_minute = v;
            }
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}RATE_LIMIT_TOKENS_PER_MINUTE")) {
            if let Ok(v) = v.parse() {
                self.rate_limit.tokens_per_minute = v;
            }
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}LOG_FILTER")) {
            self.logging.log_filter = Cow::Owned(v);
        }
    }
}

fn read_config_file() -> Result<Config, ConfigLoadError> {
    let path = std::env::var(APP_NAME).map(|app| format!(".config/{app}.toml"))?;
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Debug, thiserror::Error)]
enum ConfigLoadError {
    #[error("GATEWAY_CONFIG env var not set: {0}")]
    EnvVar(#[from] std::env::VarError),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}
