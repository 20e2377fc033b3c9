//! Log output setup for the node daemon.
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives, defaults to `info`.
//! - `LOGGER_LEVEL`: `PRODUCTION` (JSON lines) or `DEVELOPMENT` (human
//!   readable).  Anything else is treated as `PRODUCTION`.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

pub const ENV_LOGGER_LEVEL: &str = "LOGGER_LEVEL";

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Format selected by a `LOGGER_LEVEL` value.
    pub fn from_logger_level(level: Option<&str>) -> Self {
        match level {
            Some("DEVELOPMENT") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_level_selects_format() {
        assert_eq!(LogFormat::from_logger_level(None), LogFormat::Json);
        assert_eq!(LogFormat::from_logger_level(Some("PRODUCTION")), LogFormat::Json);
        assert_eq!(LogFormat::from_logger_level(Some("DEVELOPMENT")), LogFormat::Pretty);
        assert_eq!(LogFormat::from_logger_level(Some("verbose")), LogFormat::Json);
    }
}
