//! Supervised watch loop.
//!
//! # Data Flow
//! ```text
//! subscribe(target)
//!     → resync (re-read target, emit differences vs. last known state)
//!     → batches delivered to the callback, one call per batch, in order
//!     → subscription dropped
//!     → backoff sleep → subscribe again
//! ```
//!
//! # Design Decisions
//! - The loop owns reconnecting; backends never retry on their own
//! - Cancellation is checked at every suspension point and ends the loop
//!   with `Ok(())`
//! - Consecutive failures are bounded by `max_reconnects`; a delivered
//!   batch resets the count

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::schema::WatchConfig;
use crate::config::store::{
    apply_events, diff_maps, ConfigStore, StoreError, WatchBatch, WatchTarget,
};
use crate::resilience::BackoffConfig;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch on `{target}` gave up after {attempts} failed attempts")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        last: StoreError,
    },
}

/// Runs change callbacks for a key or prefix until cancelled.
#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn ConfigStore>,
    backoff: BackoffConfig,
    max_reconnects: Option<u32>,
}

impl Watcher {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            backoff: BackoffConfig::default(),
            max_reconnects: None,
        }
    }

    pub fn from_config(store: Arc<dyn ConfigStore>, config: &WatchConfig) -> Self {
        Self {
            store,
            backoff: config.backoff,
            max_reconnects: config.max_reconnects,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_reconnects(mut self, max: Option<u32>) -> Self {
        self.max_reconnects = max;
        self
    }

    /// Call `on_change(key, value)` for every change of `key`.
    ///
    /// A delete is reported with an empty value.
    pub async fn watch<F>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut on_change: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&str, &str) + Send,
    {
        self.run(WatchTarget::Key(key.to_string()), None, cancel, |batch| {
            for event in &batch.events {
                on_change(&event.key, &event.value);
            }
        })
        .await
    }

    /// Call `on_batch` once per batch of changes under `prefix`.
    pub async fn watch_prefix<F>(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
        on_batch: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&WatchBatch) + Send,
    {
        self.run(WatchTarget::Prefix(prefix.to_string()), None, cancel, on_batch)
            .await
    }

    /// Like [`watch_prefix`](Self::watch_prefix), starting from a state the
    /// caller already holds. Changes made between that read and the first
    /// subscription are delivered as a synthetic batch.
    pub async fn watch_prefix_from<F>(
        &self,
        prefix: &str,
        baseline: BTreeMap<String, String>,
        cancel: &CancellationToken,
        on_batch: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&WatchBatch) + Send,
    {
        self.run(
            WatchTarget::Prefix(prefix.to_string()),
            Some(baseline),
            cancel,
            on_batch,
        )
        .await
    }

    async fn read_target(&self, target: &WatchTarget) -> Result<BTreeMap<String, String>, StoreError> {
        match target {
            WatchTarget::Prefix(prefix) => self.store.get_prefix(prefix).await,
            WatchTarget::Key(key) => Ok(self
                .store
                .get(key)
                .await?
                .map(|value| (key.clone(), value))
                .into_iter()
                .collect()),
        }
    }

    async fn run<F>(
        &self,
        target: WatchTarget,
        baseline: Option<BTreeMap<String, String>>,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&WatchBatch) + Send,
    {
        // Last state of the target the callback has been told about.
        let mut known = baseline;
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.store.subscribe(target.clone()) => res,
            };

            let last = match subscribed {
                Err(e) => e,
                Ok(mut sub) => {
                    let resync = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        res = self.read_target(&target) => res,
                    };
                    match resync {
                        Err(e) => e,
                        Ok(current) => {
                            if let Some(previous) = known.as_ref() {
                                let events = diff_maps(previous, &current, &target);
                                if !events.is_empty() {
                                    tracing::info!(
                                        watched = target.as_str(),
                                        changes = events.len(),
                                        "Resynchronized watch after (re)subscribe"
                                    );
                                    on_batch(&WatchBatch::new(0, events));
                                }
                            }
                            let state = known.insert(current);
                            tracing::debug!(watched = target.as_str(), backend = self.store.name(), "Watch subscribed");

                            loop {
                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => return Ok(()),
                                    next = sub.next() => match next {
                                        Some(Ok(batch)) => {
                                            failures = 0;
                                            apply_events(state, &batch.events);
                                            on_batch(&batch);
                                        }
                                        Some(Err(e)) => break e,
                                        None => break StoreError::SubscriptionClosed,
                                    },
                                }
                            }
                        }
                    }
                }
            };

            failures += 1;
            if let Some(max) = self.max_reconnects {
                if failures > max {
                    tracing::error!(
                        watched = target.as_str(),
                        attempts = failures,
                        error = %last,
                        "Watch reconnect attempts exhausted"
                    );
                    return Err(WatchError::Exhausted {
                        target: target.as_str().to_string(),
                        attempts: failures,
                        last,
                    });
                }
            }

            let delay = self.backoff.delay(failures);
            tracing::warn!(
                watched = target.as_str(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Watch subscription lost, reconnecting"
            );
            crate::observability::metrics::record_watch_reconnect(target.as_str());

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryStore;
    use crate::config::store::WatchEvent;
    use std::sync::Mutex;
    use std::time::Duration;

    fn fast() -> BackoffConfig {
        BackoffConfig { base_delay_ms: 5, max_delay_ms: 20 }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_prefix_watch_sees_writes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(store.clone()).with_backoff(fast());
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                watcher
                    .watch_prefix("admin/", &cancel, |batch| {
                        let mut seen = seen.lock().unwrap();
                        seen.extend(batch.events.iter().map(|e| e.value.clone()));
                    })
                    .await
            })
        };

        // Let the loop subscribe before writing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..20 {
            store.put(&format!("admin/k{i}"), &i.to_string()).await.unwrap();
        }
        wait_for(|| seen.lock().unwrap().len() == 20).await;

        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_key_watch_reports_deletes_as_empty() {
        let store = Arc::new(MemoryStore::with_entries([("admin/env", "dev")]));
        let watcher = Watcher::new(store.clone());
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                watcher
                    .watch("admin/env", &cancel, |k, v| seen.lock().unwrap().push((k.to_string(), v.to_string())))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.put("admin/env", "prod").await.unwrap();
        store.put("admin/other", "x").await.unwrap();
        store.delete("admin/env").await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 2).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("admin/env".to_string(), "prod".to_string()), ("admin/env".to_string(), String::new())]
        );
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_missed_changes() {
        let store = Arc::new(MemoryStore::with_entries([("admin/a", "1")]));
        let watcher = Watcher::new(store.clone()).with_backoff(BackoffConfig {
            base_delay_ms: 200,
            max_delay_ms: 200,
        });
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(store.get_prefix("admin/").await.unwrap()));

        let task = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                watcher
                    .watch_prefix("admin/", &cancel, |batch| {
                        apply_events(&mut state.lock().unwrap(), &batch.events);
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Written while the loop is backing off.
        store.disconnect_watchers();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.apply(vec![WatchEvent::put("admin/b", "2"), WatchEvent::delete("admin/a")]);

        wait_for(|| {
            let state = state.lock().unwrap();
            state.get("admin/b").map(String::as_str) == Some("2") && !state.contains_key("admin/a")
        })
        .await;

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_baseline_changes_are_delivered() {
        let store = Arc::new(MemoryStore::with_entries([("admin/a", "2"), ("admin/b", "1")]));
        let watcher = Watcher::new(store.clone());
        let cancel = CancellationToken::new();
        let batches = Arc::new(Mutex::new(Vec::new()));

        let baseline: BTreeMap<String, String> =
            [("admin/a".to_string(), "1".to_string()), ("admin/c".to_string(), "3".to_string())].into();

        let task = {
            let batches = batches.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                watcher
                    .watch_prefix_from("admin/", baseline, &cancel, |batch| batches.lock().unwrap().push(batch.clone()))
                    .await
            })
        };
        wait_for(|| !batches.lock().unwrap().is_empty()).await;

        let first = batches.lock().unwrap()[0].changes();
        assert_eq!(first.get("admin/a").map(String::as_str), Some("2"));
        assert_eq!(first.get("admin/b").map(String::as_str), Some("1"));
        assert_eq!(first.get("admin/c").map(String::as_str), Some(""));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_after_max_reconnects() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(store.clone())
            .with_backoff(fast())
            .with_max_reconnects(Some(2));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.watch_prefix("admin/", &cancel, |_| {}).await })
        };

        // Keep dropping subscriptions until the loop gives up.
        let result = tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                store.disconnect_watchers();
                tokio::time::sleep(Duration::from_millis(10)).await;
                if task.is_finished() {
                    break task.await.unwrap();
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(WatchError::Exhausted { attempts: 3, .. })));
    }
}
