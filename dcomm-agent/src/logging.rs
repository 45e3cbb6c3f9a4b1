//! Log subscriber setup.

use std::path::Path;
use std::sync::Mutex;

use dcomm_core::{DcommError, DcommResult};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, replaces the configured level. Output goes to
/// `log_file` (appending, no colour) or to stderr.
pub fn init_logging(config: &LoggingConfig, log_file: Option<&Path>) -> DcommResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    let writer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DcommError::Config(format!("Failed to create log directory: {}", e))
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    DcommError::Config(format!("Failed to open log file {}: {}", path.display(), e))
                })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let base_subscriber = Registry::default().with(filter);
    let installed = match config.format {
        LogFormat::Json => base_subscriber
            .with(fmt::layer().json().with_target(true).with_writer(writer))
            .try_init(),
        LogFormat::Text => base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(log_file.is_none())
                    .with_writer(writer),
            )
            .try_init(),
    };
    installed.map_err(|e| DcommError::Config(format!("Failed to install log subscriber: {}", e)))
}

/// Parse a filter directive such as `info` or `dcomm_agent=debug,warn`.
pub fn parse_filter(level: &str) -> DcommResult<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| DcommError::Config(format!("Invalid log level \"{}\": {}", level, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_and_directives() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("dcomm_agent=debug,warn").is_ok());
        assert!(parse_filter("dcomm_agent=loud").is_err());
    }
}
