//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem. Allocation
//! events are emitted at `trace`, lifecycle events at `debug`, and
//! swallowed driver failures at `warn`; this module only installs the
//! subscriber that makes them visible.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,uniforge=trace")
//! - `UNIFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `UNIFORGE_LOG_FORMAT`: Output format ("human" or "json")

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default log level when no environment variable is set
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "UNIFORGE_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "UNIFORGE_LOG_FORMAT";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format string provided
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "text" | "pretty" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize logging from environment variables
///
/// Resolution order for the filter: `RUST_LOG` if set, else
/// `UNIFORGE_LOG_LEVEL`, else "info". Safe to call more than once; only
/// the first call installs a subscriber.
pub fn init_logging() -> Result<(), LoggingError> {
    let level = match std::env::var(LOG_LEVEL_ENV) {
        Ok(s) => LogLevel::parse(&s).ok_or(LoggingError::InvalidLogLevel(s))?,
        Err(_) => LogLevel::default(),
    };
    let format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(s) => LogFormat::parse(&s).ok_or(LoggingError::InvalidLogFormat(s))?,
        Err(_) => LogFormat::default(),
    };
    init_logging_with(level, format);
    Ok(())
}

/// Initialize logging with explicit level and format
///
/// `RUST_LOG` still takes precedence over `level` when set, so operators
/// can raise verbosity for a single module without a rebuild.
pub fn init_logging_with(level: LogLevel, format: LogFormat) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if level == LogLevel::default() {
                DEFAULT_LOG_LEVEL.to_string()
            } else {
                level.as_filter_str().to_string()
            })
        });

        match format {
            LogFormat::Human => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_target(true))
                    .init();
            }
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_target(true))
                    .init();
            }
        }

        tracing::debug!(?level, ?format, "uniforge logging initialized");
    });
}

/// Check whether logging has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn test_filter_str_round_trip() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(LogLevel::parse(level.as_filter_str()), Some(level));
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging_with(LogLevel::Debug, LogFormat::Human);
        init_logging_with(LogLevel::Trace, LogFormat::Json);
        assert!(is_initialized());
    }
}
