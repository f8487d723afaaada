//! Command-line and environment overrides for the bootstrap file.
//!
//! Precedence, highest first: flag, environment variable, bootstrap file,
//! built-in default.

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::config::loader::{load_bootstrap, ConfigError};
use crate::config::schema::{BootstrapConfig, LogFormat, StoreBackend};
use crate::config::validation::validate_bootstrap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Etcd,
    File,
    Memory,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Etcd => StoreBackend::Etcd,
            BackendArg::File => StoreBackend::File,
            BackendArg::Memory => StoreBackend::Memory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Bootstrap options shared by the service and the operator CLI.
#[derive(Debug, Clone, Default, Args)]
pub struct BootstrapArgs {
    /// Bootstrap TOML file.
    #[arg(short, long, env = "SERVEKIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Configuration store backend.
    #[arg(long, env = "SERVEKIT_BACKEND", value_enum)]
    pub backend: Option<BackendArg>,

    /// Comma-separated etcd endpoints.
    #[arg(long, env = "SERVEKIT_ENDPOINTS")]
    pub endpoints: Option<String>,

    /// File backend path.
    #[arg(long, env = "SERVEKIT_STORE_PATH")]
    pub store_path: Option<String>,

    /// Configuration namespace.
    #[arg(short, long, env = "SERVEKIT_NAMESPACE")]
    pub namespace: Option<String>,

    /// Log filter directive.
    #[arg(long, env = "SERVEKIT_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "SERVEKIT_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Append logs to this file.
    #[arg(long, env = "SERVEKIT_LOG_FILE")]
    pub log_file: Option<String>,

    /// Expose Prometheus metrics on this address.
    #[arg(long, env = "SERVEKIT_METRICS_ADDRESS")]
    pub metrics_address: Option<String>,
}

impl BootstrapArgs {
    /// Merge the bootstrap file (if any) with the overrides and validate.
    pub fn resolve(&self) -> Result<BootstrapConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_bootstrap(path)?,
            None => BootstrapConfig::default(),
        };
        self.apply(&mut config);
        validate_bootstrap(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply(&self, config: &mut BootstrapConfig) {
        if let Some(backend) = self.backend {
            config.store.backend = backend.into();
        }
        if let Some(endpoints) = &self.endpoints {
            config.store.endpoints = endpoints.clone();
        }
        if let Some(path) = &self.store_path {
            config.store.path = path.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.store.namespace = namespace.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format.into();
        }
        if let Some(path) = &self.log_file {
            config.logging.path = Some(path.clone());
        }
        if let Some(address) = &self.metrics_address {
            config.metrics.enabled = true;
            config.metrics.address = address.clone();
        }
    }
}
