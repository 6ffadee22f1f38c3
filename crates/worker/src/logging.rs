//! Logging setup for the worker.
//!
//! - Development: pretty human-readable logs (default)
//! - Aggregation: JSON logs, one object per line
//!
//! Set `DBRX_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels; it wins over `--log-level`.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Detect log format from `DBRX_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("DBRX_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber. Rank threads log through it with their
/// thread names, so every line can be traced back to a rank.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_thread_names(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        // Case insensitive
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Pretty);
    }

    #[test]
    fn test_init_twice_is_an_error_not_a_panic() {
        let _ = init("warn", LogFormat::Pretty);
        assert!(init("warn", LogFormat::Pretty).is_err());
    }
}
