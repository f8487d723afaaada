//! In-process configuration store.
//!
//! Keeps the whole key space in a map guarded by one lock. Every write
//! bumps the revision and is fanned out to subscribers while the lock is
//! held, so batches are delivered in write order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::store::{
    AbortOnDrop, ConfigStore, StoreError, Subscription, WatchBatch, WatchEvent, WatchTarget,
};

const FANOUT_CAPACITY: usize = 1024;

struct MemoryInner {
    data: BTreeMap<String, String>,
    revision: u64,
    /// Cancelled to force every open subscription closed.
    epoch: CancellationToken,
}

/// A [`ConfigStore`] living entirely in memory.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fanout: broadcast::Sender<WatchBatch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner {
                data: BTreeMap::new(),
                revision: 0,
                epoch: CancellationToken::new(),
            }),
            fanout,
        }
    }

    /// Create a store pre-populated with `entries` (no events emitted).
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut inner = store.lock();
            inner.data = entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        }
        store
    }

    /// Apply several mutations as a single batch.
    pub fn apply(&self, events: Vec<WatchEvent>) -> u64 {
        let mut inner = self.lock();
        inner.revision += 1;
        crate::config::store::apply_events(&mut inner.data, &events);
        let batch = WatchBatch::new(inner.revision, events);
        // No receivers is fine.
        let _ = self.fanout.send(batch);
        inner.revision
    }

    /// Close every open subscription, as a backend restart would.
    pub fn disconnect_watchers(&self) {
        let mut inner = self.lock();
        let old = std::mem::replace(&mut inner.epoch, CancellationToken::new());
        old.cancel();
        tracing::debug!(revision = inner.revision, "Memory store dropped all watchers");
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(vec![WatchEvent::put(key, value)]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let present = self.lock().data.contains_key(key);
        if present {
            self.apply(vec![WatchEvent::delete(key)]);
        }
        Ok(())
    }

    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription, StoreError> {
        let (mut feed, epoch) = {
            let inner = self.lock();
            (self.fanout.subscribe(), inner.epoch.child_token())
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = epoch.cancelled() => {
                        let _ = tx.send(Err(StoreError::SubscriptionClosed));
                        return;
                    }
                    next = feed.recv() => match next {
                        Ok(batch) => {
                            let batch = batch.filtered(&target);
                            if !batch.is_empty() && tx.send(Ok(batch)).is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let _ = tx.send(Err(StoreError::Backend(format!(
                                "subscriber lagged behind by {missed} batches"
                            ))));
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Ok(Subscription::new(rx).with_guard(AbortOnDrop(task)))
    }
}
