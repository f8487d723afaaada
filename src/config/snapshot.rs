//! In-memory mirror of a configuration namespace.
//!
//! # Design Decisions
//! - A `ConfigSnapshot` is immutable; a delta always produces a new one
//! - `SharedSnapshot` publishes snapshots through `ArcSwap`, so readers get
//!   either the old or the new map and never a half-merged one
//! - Only the watch loop writes; request handlers and the supervisor read

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::store::{apply_events, WatchBatch};

/// Immutable key → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    entries: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Value of `<namespace>/<field>`.
    pub fn field(&self, namespace: &str, field: &str) -> Option<&str> {
        self.get(&format!("{namespace}/{field}"))
    }

    /// Fields of `namespace` with the `<namespace>/` prefix stripped.
    pub fn namespace(&self, namespace: &str) -> BTreeMap<&str, &str> {
        let prefix = format!("{namespace}/");
        self.entries
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|f| (f, v.as_str())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// New snapshot with `batch` merged in (last write wins per key).
    pub fn merged(&self, batch: &WatchBatch) -> ConfigSnapshot {
        let mut entries = self.entries.clone();
        apply_events(&mut entries, &batch.events);
        ConfigSnapshot { entries }
    }
}

impl From<BTreeMap<String, String>> for ConfigSnapshot {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self::new(entries)
    }
}

/// Atomically swappable handle to the current snapshot.
#[derive(Clone)]
pub struct SharedSnapshot {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Current snapshot. Cheap; holds no lock.
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Merge `batch` copy-on-write and publish the result.
    pub fn apply(&self, batch: &WatchBatch) -> Arc<ConfigSnapshot> {
        let mut published = None;
        self.inner.rcu(|current| {
            let next = Arc::new(current.merged(batch));
            published = Some(next.clone());
            next
        });
        published.unwrap_or_else(|| self.inner.load_full())
    }

    /// Replace the snapshot wholesale.
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::WatchEvent;

    fn snapshot(pairs: &[(&str, &str)]) -> ConfigSnapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>().into()
    }

    #[test]
    fn test_namespace_strips_prefix() {
        let snap = snapshot(&[("admin/server_host", ":8081"), ("admin/env", "dev"), ("billing/x", "1")]);
        let ns = snap.namespace("admin");
        assert_eq!(ns.len(), 2);
        assert_eq!(ns.get("server_host"), Some(&":8081"));
        assert_eq!(snap.field("admin", "env"), Some("dev"));
    }

    #[test]
    fn test_apply_is_copy_on_write() {
        let shared = SharedSnapshot::new(snapshot(&[("admin/server_host", ":8081")]));
        let before = shared.load();

        let after = shared.apply(&WatchBatch::new(
            2,
            vec![WatchEvent::put("admin/server_host", ":9090"), WatchEvent::put("admin/env", "prod")],
        ));

        // The reader holding the old snapshot is unaffected.
        assert_eq!(before.get("admin/server_host"), Some(":8081"));
        assert_eq!(before.len(), 1);
        assert_eq!(after.get("admin/server_host"), Some(":9090"));
        assert_eq!(shared.load().get("admin/env"), Some("prod"));
    }

    #[test]
    fn test_delete_removes_key() {
        let shared = SharedSnapshot::new(snapshot(&[("admin/a", "1"), ("admin/b", "2")]));
        shared.apply(&WatchBatch::new(1, vec![WatchEvent::delete("admin/a")]));
        let current = shared.load();
        assert_eq!(current.get("admin/a"), None);
        assert_eq!(current.len(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let shared = SharedSnapshot::new(snapshot(&[("admin/a", "0"), ("admin/b", "0")]));
        let reader = shared.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..10_000 {
                let snap = reader.load();
                assert_eq!(snap.get("admin/a"), snap.get("admin/b"));
            }
        });
        for i in 1..500 {
            let v = i.to_string();
            shared.apply(&WatchBatch::new(
                i,
                vec![WatchEvent::put("admin/a", v.clone()), WatchEvent::put("admin/b", v)],
            ));
        }
        handle.join().unwrap();
    }
}
