//! Configuration schema definitions.
//!
//! Two layers of configuration exist:
//! - [`BootstrapConfig`]: how to reach the store and set up logging.
//!   Read once at process start from a TOML file and the command line.
//! - [`ServiceSettings`]: what the running service looks like. Derived
//!   from the store snapshot and rebuilt on every change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::store::StoreTimeouts;
use crate::resilience::BackoffConfig;

/// Root bootstrap configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Configuration store connection.
    pub store: StoreConfig,

    /// Watch loop behaviour.
    pub watch: WatchConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,
}

/// Which backend holds the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    File,
    Memory,
}

/// Store connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Comma-separated etcd endpoints (e.g. "127.0.0.1:2379").
    pub endpoints: String,

    /// TOML file used by the `file` backend.
    pub path: String,

    /// Namespace holding the service settings (keys `<namespace>/<field>`).
    pub namespace: String,

    /// Deadline for get/put/delete, in milliseconds.
    pub request_timeout_ms: u64,

    /// Deadline for establishing a connection, in milliseconds.
    pub dial_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: "127.0.0.1:2379".to_string(),
            path: "servekit.toml".to_string(),
            namespace: "admin".to_string(),
            request_timeout_ms: 3_000,
            dial_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn timeouts(&self) -> StoreTimeouts {
        StoreTimeouts {
            request: Duration::from_millis(self.request_timeout_ms),
            dial: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    /// Prefix under which the namespace keys live.
    pub fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }
}

/// Watch loop settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WatchConfig {
    /// Reconnect backoff.
    pub backoff: BackoffConfig,

    /// Consecutive failed reconnects before giving up (unbounded when absent).
    pub max_reconnects: Option<u32>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,

    pub format: LogFormat,

    /// Append logs to this file instead of stdout.
    pub path: Option<String>,

    /// Service name attached to every log line.
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "servekit=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
            path: None,
            service_name: "servekit".to_string(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose a Prometheus endpoint.
    pub enabled: bool,

    /// Metrics endpoint bind address.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Env {
    #[default]
    Dev,
    Prod,
}

/// Settings of one serving instance, derived from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Address handed to the listener (e.g. "0.0.0.0:8081").
    pub bind_address: String,

    pub env: Env,

    /// In-flight drain budget on reload and shutdown.
    pub drain_timeout: Duration,

    /// Per-request deadline.
    pub request_timeout: Duration,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".to_string(),
            env: Env::Dev,
            drain_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}
