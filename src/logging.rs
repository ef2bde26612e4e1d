//! # Structured Logging Module
//!
//! Environment-aware structured logging for the coordination core. Console
//! output uses the standard compact format; setting
//! `PIPELINE_COORD_LOG_JSON=1` switches to JSON lines for ingestion by a log
//! pipeline.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Safe to call from multiple embedding points; if a global subscriber is
/// already installed (for example by the host orchestration engine) this is
/// a no-op.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&detect_environment())));

        let json_output = std::env::var("PIPELINE_COORD_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let layer = if json_output {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(layer.with_filter(env_filter));

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }
    });
}

/// Detect the runtime environment from environment variables
fn detect_environment() -> String {
    std::env::var("PIPELINE_COORD_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Map environment to a default log level
fn default_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
