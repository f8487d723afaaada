//! Configuration validation.
//!
//! # Responsibilities
//! - Turn the raw `<namespace>/<field>` strings of a snapshot into typed
//!   [`ServiceSettings`]
//! - Check bootstrap options before any connection is attempted
//! - Validate value ranges (timeouts > 0, ports valid)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of its input; nothing is bound or dialed
//! - Unknown fields in the namespace are ignored; route sets may read them

use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{BootstrapConfig, Env, ServiceSettings, StoreBackend};
use crate::config::snapshot::ConfigSnapshot;

/// One semantic problem with a setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("missing required setting `{key}`")]
    Missing { key: String },

    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl SettingsError {
    fn invalid(key: impl Into<String>, value: &str, reason: impl Into<String>) -> Self {
        SettingsError::Invalid {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Derive the serving settings for `namespace` from `snapshot`.
pub fn resolve_settings(
    snapshot: &ConfigSnapshot,
    namespace: &str,
) -> Result<ServiceSettings, Vec<SettingsError>> {
    let fields = snapshot.namespace(namespace);
    let key = |field: &str| format!("{namespace}/{field}");
    let defaults = ServiceSettings::default();
    let mut errors = Vec::new();

    let env = match fields.get("env").map(|v| v.trim()) {
        None | Some("") => defaults.env,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "dev" | "development" => Env::Dev,
            "prod" | "production" => Env::Prod,
            _ => {
                errors.push(SettingsError::invalid(key("env"), v, "expected `dev` or `prod`"));
                defaults.env
            }
        },
    };

    let bind_address = match fields.get("server_host") {
        None => {
            errors.push(SettingsError::Missing { key: key("server_host") });
            String::new()
        }
        Some(raw) => match normalize_host(raw.trim(), env) {
            Ok(addr) => addr,
            Err(reason) => {
                errors.push(SettingsError::invalid(key("server_host"), raw, reason));
                String::new()
            }
        },
    };

    let mut positive = |field: &str, default: u64| -> u64 {
        match fields.get(field).map(|v| v.trim()) {
            None | Some("") => default,
            Some(v) => match v.parse::<u64>() {
                Ok(0) => {
                    errors.push(SettingsError::invalid(key(field), v, "must be greater than zero"));
                    default
                }
                Ok(n) => n,
                Err(e) => {
                    errors.push(SettingsError::invalid(key(field), v, e.to_string()));
                    default
                }
            },
        }
    };

    let drain_ms = positive("drain_timeout_ms", defaults.drain_timeout.as_millis() as u64);
    let request_secs = positive("request_timeout_secs", defaults.request_timeout.as_secs());
    let max_body = positive("max_body_bytes", defaults.max_body_bytes as u64);

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ServiceSettings {
        bind_address,
        env,
        drain_timeout: Duration::from_millis(drain_ms),
        request_timeout: Duration::from_secs(request_secs),
        max_body_bytes: usize::try_from(max_body).unwrap_or(usize::MAX),
    })
}

/// Expand the short host forms into a bindable `host:port`.
///
/// `:8081` binds every interface. An empty host picks a free port in dev
/// and port 80 in prod.
fn normalize_host(raw: &str, env: Env) -> Result<String, String> {
    if raw.is_empty() {
        return Ok(match env {
            Env::Dev => "0.0.0.0:0".to_string(),
            Env::Prod => "0.0.0.0:80".to_string(),
        });
    }

    let Some((host, port)) = raw.rsplit_once(':') else {
        return Err("expected `host:port` or `:port`".to_string());
    };
    port.parse::<u16>().map_err(|e| format!("invalid port: {e}"))?;

    if host.is_empty() {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(raw.to_string())
    }
}

/// Check the bootstrap options.
pub fn validate_bootstrap(config: &BootstrapConfig) -> Result<(), Vec<SettingsError>> {
    let mut errors = Vec::new();
    let store = &config.store;

    if store.namespace.trim().is_empty() || store.namespace.contains('/') {
        errors.push(SettingsError::invalid(
            "store.namespace",
            &store.namespace,
            "must be a non-empty name without `/`",
        ));
    }

    match store.backend {
        StoreBackend::Etcd if store.endpoints.split(',').all(|e| e.trim().is_empty()) => {
            errors.push(SettingsError::Missing { key: "store.endpoints".into() });
        }
        StoreBackend::File if store.path.trim().is_empty() => {
            errors.push(SettingsError::Missing { key: "store.path".into() });
        }
        _ => {}
    }

    if store.request_timeout_ms == 0 {
        errors.push(SettingsError::invalid("store.request_timeout_ms", "0", "must be greater than zero"));
    }
    if store.dial_timeout_ms == 0 {
        errors.push(SettingsError::invalid("store.dial_timeout_ms", "0", "must be greater than zero"));
    }

    let backoff = &config.watch.backoff;
    if backoff.base_delay_ms == 0 || backoff.max_delay_ms < backoff.base_delay_ms {
        errors.push(SettingsError::invalid(
            "watch.backoff",
            &format!("{}..{}", backoff.base_delay_ms, backoff.max_delay_ms),
            "base delay must be positive and not exceed max delay",
        ));
    }

    if config.metrics.enabled && config.metrics.address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(SettingsError::invalid(
            "metrics.address",
            &config.metrics.address,
            "expected a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(pairs: &[(&str, &str)]) -> ConfigSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn test_short_host_binds_all_interfaces() {
        let settings = resolve_settings(&snapshot(&[("admin/server_host", ":8081")]), "admin").unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0:8081");
        assert_eq!(settings.env, Env::Dev);
        assert_eq!(settings.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_host_depends_on_env() {
        let dev = resolve_settings(&snapshot(&[("admin/server_host", "")]), "admin").unwrap();
        assert_eq!(dev.bind_address, "0.0.0.0:0");

        let prod = resolve_settings(
            &snapshot(&[("admin/server_host", ""), ("admin/env", "prod")]),
            "admin",
        )
        .unwrap();
        assert_eq!(prod.bind_address, "0.0.0.0:80");
        assert_eq!(prod.env, Env::Prod);
    }

    #[test]
    fn test_all_errors_are_reported() {
        let errors = resolve_settings(
            &snapshot(&[("admin/env", "staging"), ("admin/drain_timeout_ms", "0")]),
            "admin",
        )
        .unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&SettingsError::Missing { key: "admin/server_host".into() }));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let settings = resolve_settings(
            &snapshot(&[
                ("admin/server_host", "127.0.0.1:9000"),
                ("admin/drain_timeout_ms", "250"),
                ("admin/request_timeout_secs", "2"),
                ("admin/max_body_bytes", "1024"),
            ]),
            "admin",
        )
        .unwrap();
        assert_eq!(settings.bind_address, "127.0.0.1:9000");
        assert_eq!(settings.drain_timeout, Duration::from_millis(250));
        assert_eq!(settings.request_timeout, Duration::from_secs(2));
        assert_eq!(settings.max_body_bytes, 1024);
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let errors = resolve_settings(&snapshot(&[("admin/server_host", "localhost:http")]), "admin").unwrap_err();
        assert!(matches!(&errors[0], SettingsError::Invalid { key, .. } if key == "admin/server_host"));
    }

    #[test]
    fn test_bootstrap_defaults_are_valid() {
        assert!(validate_bootstrap(&BootstrapConfig::default()).is_ok());

        let mut config = BootstrapConfig::default();
        config.store.namespace = String::new();
        config.store.request_timeout_ms = 0;
        assert_eq!(validate_bootstrap(&config).unwrap_err().len(), 2);
    }
}
