//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber once at startup
//! - Pick pretty or JSON output and the sink (stdout or an append-only file)
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured filter when set
//! - JSON events are flattened so fields sit next to `message`

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },

    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("logging already initialised: {0}")]
    Install(#[from] TryInitError),
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config.level)?;
    let writer = build_writer(config.path.as_deref())?;
    let ansi = config.path.is_none();

    let (pretty, json) = match config.format {
        LogFormat::Pretty => (
            Some(fmt::layer().with_writer(writer).with_ansi(ansi).with_target(true)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().flatten_event(true).with_writer(writer).with_target(true)),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()?;
    Ok(())
}

fn build_filter(configured: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(configured).map_err(|e| LoggingError::Filter {
        filter: configured.to_string(),
        reason: e.to_string(),
    })
}

fn build_writer(path: Option<&str>) -> Result<BoxMakeWriter, LoggingError> {
    let Some(path) = path else {
        return Ok(BoxMakeWriter::new(io::stdout));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(path))
        .map_err(|source| LoggingError::File {
            path: path.to_string(),
            source,
        })?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = build_filter("servekit=loud[").unwrap_err();
        assert!(matches!(err, LoggingError::Filter { .. }));
    }

    #[test]
    fn test_file_sink_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servekit.log");
        build_writer(path.to_str()).unwrap();
        assert!(path.exists());

        let missing = dir.path().join("nope").join("servekit.log");
        assert!(matches!(build_writer(missing.to_str()), Err(LoggingError::File { .. })));
    }
}
