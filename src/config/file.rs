//! File-backed configuration store with hot reload.
//!
//! The file is a TOML document whose tables are namespaces:
//!
//! ```toml
//! [admin]
//! server_host = ":8081"
//! env = "prod"
//! ```
//!
//! which maps to the keys `admin/server_host` and `admin/env`. Top-level
//! scalar values map to a key without a namespace.
//!
//! Changes are detected with `notify` on the parent directory, so editors
//! that replace the file atomically are picked up too. Each detected change
//! is diffed against the last contents seen by the subscription and the
//! difference is delivered as one batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};

use crate::config::store::{
    diff_maps, ConfigStore, StoreError, StoreTimeouts, Subscription, WatchBatch, WatchTarget,
};
use crate::resilience::with_deadline;

/// A [`ConfigStore`] persisted as a TOML file.
pub struct FileStore {
    path: PathBuf,
    timeouts: StoreTimeouts,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>, timeouts: StoreTimeouts) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeouts,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_document(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let content = render_document(entries)?;
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn modify<F>(&self, op: &'static str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool + Send,
    {
        with_deadline(op, self.timeouts.request, async {
            let _guard = self.write_lock.lock().await;
            let mut entries = self.read().await?;
            if f(&mut entries) {
                self.write(&entries).await?;
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_deadline("get", self.timeouts.request, async {
            Ok(self.read().await?.remove(key))
        })
        .await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        with_deadline("get_prefix", self.timeouts.request, async {
            let mut entries = self.read().await?;
            entries.retain(|k, _| k.starts_with(prefix));
            Ok(entries)
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify("put", |entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.modify("delete", |entries| entries.remove(key).is_some()).await
    }

    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut last = self.read().await?;
        let path = self.path.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut revision = 0u64;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_file || !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                        return;
                    }
                    let current = match std::fs::read_to_string(&path) {
                        Ok(content) => match parse_document(&content) {
                            Ok(map) => map,
                            Err(e) => {
                                tracing::error!(path = ?path, error = %e, "Failed to parse config file, keeping last contents");
                                return;
                            }
                        },
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            // Transient during atomic replace; the create event follows.
                            return;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(StoreError::Io(e)));
                            return;
                        }
                    };
                    let events = diff_maps(&last, &current, &target);
                    last = current;
                    if !events.is_empty() {
                        revision += 1;
                        let _ = tx.send(Ok(WatchBatch::new(revision, events)));
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Config file watch error");
                    let _ = tx.send(Err(StoreError::Backend(e.to_string())));
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| StoreError::Backend(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| StoreError::Backend(format!("failed to watch {}: {e}", dir.display())))?;

        tracing::info!(path = ?self.path, "Config file watcher started");
        Ok(Subscription::new(rx).with_guard(watcher))
    }
}

/// Flatten a TOML document into `namespace/field` keys.
fn parse_document(content: &str) -> Result<BTreeMap<String, String>, StoreError> {
    let table: toml::Table = toml::from_str(content)
        .map_err(|e| StoreError::Protocol(format!("invalid TOML: {e}")))?;

    let mut entries = BTreeMap::new();
    for (name, value) in table {
        match value {
            toml::Value::Table(fields) => {
                for (field, v) in fields {
                    entries.insert(format!("{name}/{field}"), scalar_to_string(v));
                }
            }
            other => {
                entries.insert(name, scalar_to_string(other));
            }
        }
    }
    Ok(entries)
}

fn scalar_to_string(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Inverse of [`parse_document`]. Every value is written as a string.
fn render_document(entries: &BTreeMap<String, String>) -> Result<String, StoreError> {
    let mut root = toml::Table::new();
    for (key, value) in entries {
        match key.split_once('/') {
            Some((ns, field)) => {
                let slot = root
                    .entry(ns.to_string())
                    .or_insert(toml::Value::Table(toml::Table::new()));
                match slot {
                    toml::Value::Table(t) => {
                        t.insert(field.to_string(), toml::Value::String(value.clone()));
                    }
                    _ => {
                        return Err(StoreError::Protocol(format!(
                            "key '{key}' conflicts with top-level value '{ns}'"
                        )))
                    }
                }
            }
            None => {
                if root.contains_key(key) {
                    return Err(StoreError::Protocol(format!("key '{key}' conflicts with namespace '{key}'")));
                }
                root.insert(key.clone(), toml::Value::String(value.clone()));
            }
        }
    }
    toml::to_string(&root).map_err(|e| StoreError::Protocol(format!("failed to render TOML: {e}")))
}
