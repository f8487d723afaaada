//! Configuration store abstraction.
//!
//! # Responsibilities
//! - Point and prefix reads (absence is not an error)
//! - Bounded writes and deletes
//! - Ordered change subscriptions for a key or a prefix
//!
//! # Design Decisions
//! - Backends are object-safe so the supervisor holds `Arc<dyn ConfigStore>`
//! - A subscription is a plain ordered channel; reconnecting is the
//!   caller's job (see `config::watch`)
//! - Deleted keys are reported with an empty value

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::etcd::EtcdStore;
use crate::config::file::FileStore;
use crate::config::memory::MemoryStore;
use crate::config::schema::{StoreBackend, StoreConfig};

/// Errors raised while talking to a configuration backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("malformed store response: {0}")]
    Protocol(String),

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subscription closed by backend")]
    SubscriptionClosed,
}

/// Kind of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

/// One key mutation observed by a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value; empty for deletes.
    pub value: String,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: EventKind::Put, key: key.into(), value: value.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self { kind: EventKind::Delete, key: key.into(), value: String::new() }
    }
}

/// Events delivered together by the backend, in the order they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchBatch {
    /// Backend revision of the batch, 0 when unknown or synthetic.
    pub revision: u64,
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    pub fn new(revision: u64, events: Vec<WatchEvent>) -> Self {
        Self { revision, events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Final value per key after applying the batch in order.
    ///
    /// Deleted keys map to an empty value.
    pub fn changes(&self) -> BTreeMap<String, String> {
        self.events
            .iter()
            .map(|ev| (ev.key.clone(), ev.value.clone()))
            .collect()
    }

    /// Keep only the events matching `target`.
    pub fn filtered(&self, target: &WatchTarget) -> WatchBatch {
        WatchBatch {
            revision: self.revision,
            events: self.events.iter().filter(|ev| target.matches(&ev.key)).cloned().collect(),
        }
    }
}

/// What a subscription observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WatchTarget::Key(k) | WatchTarget::Prefix(k) => k,
        }
    }
}

/// An open change subscription.
///
/// Batches arrive in receipt order. `None` or an error item means the
/// backend dropped the subscription; it will not recover on its own.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Result<WatchBatch, StoreError>>,
    _guard: Option<Box<dyn Send>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<WatchBatch, StoreError>>) -> Self {
        Self { rx, _guard: None }
    }

    /// Keep `guard` alive for as long as the subscription is open.
    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub async fn next(&mut self) -> Option<Result<WatchBatch, StoreError>> {
        self.rx.recv().await
    }
}

/// Aborts a background task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Deadlines applied to every non-watch store call.
#[derive(Debug, Clone, Copy)]
pub struct StoreTimeouts {
    pub request: Duration,
    pub dial: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(3),
            dial: Duration::from_secs(5),
        }
    }
}

/// A remote, watchable key-value configuration backend.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Read one key. `Ok(None)` when the key was never written.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read every key starting with `prefix`. Empty map when none match.
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Open a change subscription. Events written after this call returns
    /// are guaranteed to be delivered.
    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription, StoreError>;
}

/// Build the backend described by `config`.
pub fn connect(config: &StoreConfig) -> Result<Arc<dyn ConfigStore>, StoreError> {
    let timeouts = config.timeouts();
    let store: Arc<dyn ConfigStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Etcd => Arc::new(EtcdStore::new(&config.endpoints, timeouts)?),
        StoreBackend::File => Arc::new(FileStore::new(&config.path, timeouts)),
    };
    tracing::info!(backend = store.name(), namespace = %config.namespace, "Configuration store ready");
    Ok(store)
}

/// Differences turning `old` into `new`, restricted to `target`.
pub fn diff_maps(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
    target: &WatchTarget,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (key, value) in new {
        if target.matches(key) && old.get(key) != Some(value) {
            events.push(WatchEvent::put(key.clone(), value.clone()));
        }
    }
    for key in old.keys() {
        if target.matches(key) && !new.contains_key(key) {
            events.push(WatchEvent::delete(key.clone()));
        }
    }
    events
}

/// Apply `events` to a plain map in order.
pub fn apply_events(map: &mut BTreeMap<String, String>, events: &[WatchEvent]) {
    for ev in events {
        match ev.kind {
            EventKind::Put => {
                map.insert(ev.key.clone(), ev.value.clone());
            }
            EventKind::Delete => {
                map.remove(&ev.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_target_matching() {
        let prefix = WatchTarget::Prefix("admin/".into());
        assert!(prefix.matches("admin/server_host"));
        assert!(!prefix.matches("billing/server_host"));

        let key = WatchTarget::Key("admin/env".into());
        assert!(key.matches("admin/env"));
        assert!(!key.matches("admin/env2"));
        assert_eq!(key.as_str(), "admin/env");
    }

    #[test]
    fn test_diff_reports_puts_and_deletes() {
        let old = map(&[("admin/a", "1"), ("admin/b", "2"), ("other/x", "9")]);
        let new = map(&[("admin/a", "1"), ("admin/c", "3"), ("other/y", "8")]);
        let events = diff_maps(&old, &new, &WatchTarget::Prefix("admin/".into()));

        assert_eq!(events, vec![WatchEvent::put("admin/c", "3"), WatchEvent::delete("admin/b")]);
    }

    #[test]
    fn test_batch_changes_last_write_wins() {
        let batch = WatchBatch::new(
            3,
            vec![
                WatchEvent::put("admin/a", "1"),
                WatchEvent::put("admin/a", "2"),
                WatchEvent::delete("admin/b"),
            ],
        );
        let changes = batch.changes();
        assert_eq!(changes.get("admin/a").map(String::as_str), Some("2"));
        assert_eq!(changes.get("admin/b").map(String::as_str), Some(""));

        let mut state = map(&[("admin/b", "old")]);
        apply_events(&mut state, &batch.events);
        assert_eq!(state, map(&[("admin/a", "2")]));
    }
}
