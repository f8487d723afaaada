//! Bootstrap configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::BootstrapConfig;
use crate::config::validation::{validate_bootstrap, SettingsError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<SettingsError>),
}

pub(crate) fn join_errors(errors: &[SettingsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate bootstrap configuration from a TOML file.
pub fn load_bootstrap(path: &Path) -> Result<BootstrapConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_bootstrap(&content)
}

/// Parse and validate bootstrap configuration from TOML text.
pub fn parse_bootstrap(content: &str) -> Result<BootstrapConfig, ConfigError> {
    let config: BootstrapConfig = toml::from_str(content)?;

    validate_bootstrap(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{LogFormat, StoreBackend};
    use std::io::Write;

    #[test]
    fn test_minimal_file_gets_defaults() {
        let config = parse_bootstrap("").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Etcd);
        assert_eq!(config.store.request_timeout_ms, 3_000);
        assert_eq!(config.watch.backoff.max_delay_ms, 5_000);
        assert!(config.watch.max_reconnects.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [store]
            backend = "file"
            path = "/etc/servekit/config.toml"
            namespace = "greeter"

            [watch]
            max_reconnects = 3

            [logging]
            format = "json"
            "#
        )
        .unwrap();

        let config = load_bootstrap(file.path()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.store.prefix(), "greeter/");
        assert_eq!(config.watch.max_reconnects, Some(3));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse_bootstrap("[store]\nnamespace = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref errs) if errs.len() == 1));
        assert!(err.to_string().starts_with("Validation failed"));

        assert!(matches!(parse_bootstrap("[store]\nbackend = \"zookeeper\"\n"), Err(ConfigError::Parse(_))));
    }
}
