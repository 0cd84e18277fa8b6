use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Fallback used when the configured level is not a valid filter directive.
pub const FALLBACK_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log format `{0}` (expected `pretty` or `json`)")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// `RUST_LOG` when set, else `level`, else [`FALLBACK_LEVEL`].
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Human-readable output. Later calls are no-ops once a global subscriber
/// is installed.
pub fn init_logging(service: &str, level: &str) {
    subscriber_fmt()
        .with_env_filter(build_filter(level))
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service, format = "pretty", "logging initialised");
}

/// One JSON object per line. Later calls are no-ops.
pub fn init_logging_json(service: &str, level: &str) {
    subscriber_fmt()
        .json()
        .with_env_filter(build_filter(level))
        .with_target(true)
        .with_current_span(true)
        .try_init()
        .ok();

    tracing::info!(service = service, format = "json", "logging initialised");
}

pub fn init(service: &str, level: &str, format: LogFormat) {
    match format {
        LogFormat::Pretty => init_logging(service, level),
        LogFormat::Json => init_logging_json(service, level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_formats() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "pretty");
    }
}
