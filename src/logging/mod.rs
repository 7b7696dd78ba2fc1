//! Logging infrastructure - structured tracing throughout the engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - Span-based call tracking for nested callback invocations

use once_cell::sync::OnceCell;
use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // CALLBRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("CALLBRIDGE_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        // CALLBRIDGE_LOG_JSON: enable JSON format
        config.json_format = std::env::var("CALLBRIDGE_LOG_JSON").is_ok();

        // CALLBRIDGE_LOG_SPANS: show span events
        config.show_spans = std::env::var("CALLBRIDGE_LOG_SPANS").is_ok();

        config
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "callbridge={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        if config.json_format {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(io::stdout)
                        .with_span_events(span_events),
                )
                .try_init();
        } else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_span_events(span_events)
                        .with_target(true)
                        .with_thread_ids(cfg!(debug_assertions))
                        .with_line_number(cfg!(debug_assertions)),
                )
                .try_init();
        }
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Log a dispatched FFI call
#[inline]
pub fn log_call(symbol: &str, arg_count: usize) {
    use tracing::debug;
    debug!(event = "ffi_call", symbol = symbol, args = arg_count, "FFI call dispatched");
}

/// Log an FFI call failure
pub fn log_call_error(symbol: &str, error: &str) {
    use tracing::error;
    error!(event = "ffi_error", symbol = symbol, error = error, "FFI call failed");
}
