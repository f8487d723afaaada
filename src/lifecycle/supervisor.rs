//! Service supervisor.
//!
//! # Responsibilities
//! - Read the namespace once at startup and refuse to start on nothing
//! - Turn every watch delta into a new serving instance
//! - Hand over without a moment where nothing is listening
//!
//! # State machine
//! ```text
//! Init → Running ⇄ Reloading → Stopping → Stopped
//! ```
//!
//! # Handover
//! ```text
//! merge delta → resolve settings → build routes
//!     → listener: same address ? share current socket : bind new one
//!     → start replacement (accepting)
//!     → old stops accepting → swap
//!     → old drains in the background (bounded)
//! ```
//! Any failure before the swap leaves the old instance serving. The merged
//! snapshot is kept, so the next good delta starts from the latest state.
//! `stop` waits for every background drain before reporting `Stopped`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::loader::join_errors;
use crate::config::{
    resolve_settings, ConfigSnapshot, ConfigStore, ServiceSettings, SettingsError, SharedSnapshot,
    StoreError, WatchBatch, WatchConfig, WatchError, Watcher,
};
use crate::http::server::AppState;
use crate::lifecycle::instance::{build_routes, InstanceError, ServiceInstance};
use crate::net::BoundListener;
use crate::observability::metrics;
use crate::routing::Application;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Running,
    Reloading,
    Stopping,
    Stopped,
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub local_addr: Option<SocketAddr>,
    /// Serving generation; 0 before the first instance.
    pub generation: u64,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration namespace {namespace:?} is empty")]
    EmptySnapshot { namespace: String },

    #[error("config store: {0}")]
    Store(#[from] StoreError),

    #[error("invalid settings: {}", join_errors(.0))]
    Settings(Vec<SettingsError>),

    #[error("instance: {0}")]
    Instance(#[from] InstanceError),

    #[error("watch: {0}")]
    Watch(#[from] WatchError),

    #[error("supervisor is {0:?}")]
    InvalidState(SupervisorState),
}

/// Owns the serving instance and replaces it on configuration change.
pub struct Supervisor {
    store: Arc<dyn ConfigStore>,
    namespace: String,
    app: Application,
    watch_config: WatchConfig,
    snapshot: SharedSnapshot,
    current: Mutex<Option<ServiceInstance>>,
    generation: AtomicU64,
    status: watch::Sender<SupervisorStatus>,
    /// Replaced instances still draining.
    retiring: TaskTracker,
}

impl Supervisor {
    pub fn new(store: Arc<dyn ConfigStore>, namespace: impl Into<String>, app: Application) -> Self {
        let (status, _) = watch::channel(SupervisorStatus {
            state: SupervisorState::Init,
            local_addr: None,
            generation: 0,
        });
        Self {
            store,
            namespace: namespace.into(),
            app,
            watch_config: WatchConfig::default(),
            snapshot: SharedSnapshot::new(ConfigSnapshot::default()),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            status,
            retiring: TaskTracker::new(),
        }
    }

    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }

    /// Read the namespace and start the first instance.
    pub async fn start(&self) -> Result<SocketAddr, SupervisorError> {
        let mut current = self.current.lock().await;
        let state = self.state();
        if state != SupervisorState::Init {
            return Err(SupervisorError::InvalidState(state));
        }

        let entries = self.store.get_prefix(&self.prefix()).await?;
        if entries.is_empty() {
            tracing::error!(namespace = %self.namespace, "Configuration namespace is empty, refusing to start");
            return Err(SupervisorError::EmptySnapshot {
                namespace: self.namespace.clone(),
            });
        }
        tracing::info!(namespace = %self.namespace, keys = entries.len(), "Configuration loaded");
        self.snapshot.replace(ConfigSnapshot::new(entries));

        let settings = self.settings()?;
        let router = self.router(&settings)?;
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = ServiceInstance::bind(id, settings, router).await?;
        let address = instance.local_addr();
        *current = Some(instance);

        self.publish(SupervisorState::Running, Some(address), id);
        tracing::info!(address = %address, generation = id, "Service started");
        Ok(address)
    }

    /// Merge `batch` into the snapshot and hand over to a new instance.
    pub async fn apply_delta(&self, batch: &WatchBatch) -> Result<(), SupervisorError> {
        if batch.is_empty() {
            metrics::record_reload("skipped");
            return Ok(());
        }

        let mut current = self.current.lock().await;
        let state = self.state();
        if state != SupervisorState::Running {
            return Err(SupervisorError::InvalidState(state));
        }
        let Some(mut old) = current.take() else {
            return Err(SupervisorError::InvalidState(state));
        };

        self.set_state(SupervisorState::Reloading);
        self.snapshot.apply(batch);
        tracing::info!(revision = batch.revision, changes = batch.events.len(), "Reloading");

        match self.replacement(&old).await {
            Ok(next) => {
                let address = next.local_addr();
                let id = next.id();
                let drain = old.settings().drain_timeout;
                old.stop_accepting().await;
                *current = Some(next);
                self.publish(SupervisorState::Reloading, Some(address), id);

                let retired = old.id();
                self.retiring.spawn(async move {
                    old.stop(drain).await;
                    tracing::debug!(generation = retired, "Replaced instance retired");
                });

                self.set_state(SupervisorState::Running);
                metrics::record_reload("applied");
                tracing::info!(address = %address, generation = id, "Reload complete");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, generation = old.id(), "Reload failed, keeping current instance");
                *current = Some(old);
                self.set_state(SupervisorState::Running);
                metrics::record_reload("failed");
                Err(e)
            }
        }
    }

    async fn replacement(&self, old: &ServiceInstance) -> Result<ServiceInstance, SupervisorError> {
        let settings = self.settings()?;
        let router = self.router(&settings)?;
        let listener = if settings.bind_address == old.requested() {
            old.share_listener()?
        } else {
            BoundListener::bind(&settings.bind_address)
                .await
                .map_err(InstanceError::from)?
        };
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ServiceInstance::start(id, settings, router, listener)?)
    }

    /// Follow the namespace until `cancel`, reloading on every delta, then stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let state = self.state();
        if state != SupervisorState::Running {
            return Err(SupervisorError::InvalidState(state));
        }

        let watcher = Watcher::from_config(Arc::clone(&self.store), &self.watch_config);
        let prefix = self.prefix();
        let baseline = self.snapshot.load().entries().clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchBatch>();

        let watching = async {
            let result = watcher
                .watch_prefix_from(&prefix, baseline, &cancel, move |batch| {
                    let _ = tx.send(batch.clone());
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Configuration watch gave up, serving frozen configuration");
                cancel.cancelled().await;
            }
        };

        let reloading = async {
            while let Some(batch) = rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                // Failures are logged and counted inside; keep following.
                let _ = self.apply_delta(&batch).await;
            }
        };

        tokio::join!(watching, reloading);
        self.stop().await;
        Ok(())
    }

    /// Drain the serving instance, wait for replaced ones still draining, and
    /// refuse further reloads.
    pub async fn stop(&self) {
        let mut current = self.current.lock().await;
        if matches!(self.state(), SupervisorState::Stopping | SupervisorState::Stopped) {
            return;
        }
        self.set_state(SupervisorState::Stopping);
        if let Some(instance) = current.take() {
            tracing::info!(generation = instance.id(), "Stopping service");
            let drain = instance.settings().drain_timeout;
            instance.stop(drain).await;
        }
        self.retiring.close();
        self.retiring.wait().await;
        self.publish(SupervisorState::Stopped, None, self.generation.load(Ordering::SeqCst));
        tracing::info!("Service stopped");
    }

    pub fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> &SharedSnapshot {
        &self.snapshot
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn settings(&self) -> Result<ServiceSettings, SupervisorError> {
        resolve_settings(&self.snapshot.load(), &self.namespace).map_err(SupervisorError::Settings)
    }

    fn router(&self, settings: &ServiceSettings) -> Result<axum::Router, SupervisorError> {
        let state = AppState::new(self.snapshot.clone(), &self.namespace, settings.clone());
        Ok(build_routes(|| self.app.router(state, settings))?)
    }

    fn set_state(&self, state: SupervisorState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn publish(&self, state: SupervisorState, local_addr: Option<SocketAddr>, generation: u64) {
        self.status.send_replace(SupervisorStatus {
            state,
            local_addr,
            generation,
        });
    }
}
