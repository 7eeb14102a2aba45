//! Structured logging initialization (SPEC_FULL §9.1), grounded on
//! `vkteams-bot`'s OTLP/fmt layer setup: an env-filter directive plus a
//! selectable output format.

use gateway_core::config::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

pub fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_new(settings.log_filter.as_ref())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match settings.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Full => subscriber.with_target(true).init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}
