//! One serving generation.
//!
//! # Responsibilities
//! - Serve a frozen router on a listener that is already accepting
//! - Stop accepting on request, separately from draining
//! - Drain accepted connections within a budget
//!
//! # Design Decisions
//! - The listener is bound before the instance exists, so a constructed
//!   instance is always reachable
//! - Each connection is driven by its own task so a drain can treat a
//!   connection that has not sent its first request differently from an
//!   idle keep-alive one
//! - Stopping never blocks past the drain budget; leftovers are aborted
//!
//! # Stop sequence
//! ```text
//! stop_accepting → accept loop exits, listening handles closed
//! stop(drain)    → connections: wait for first request (bounded window)
//!                → graceful shutdown → abort at the drain budget
//! ```

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::middleware;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::Instrument;

use crate::config::ServiceSettings;
use crate::net::{BoundListener, InflightTracker, ListenerError};

/// How long a draining connection may take to deliver its first request.
pub const FIRST_REQUEST_WINDOW: Duration = Duration::from_secs(1);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("failed to build routes: {0}")]
    Routes(String),

    #[error("instance {0} is no longer accepting")]
    NotAccepting(u64),
}

#[derive(Clone)]
struct Signals {
    accept: CancellationToken,
    drain: CancellationToken,
    abort: CancellationToken,
}

/// A running server generation.
pub struct ServiceInstance {
    id: u64,
    settings: ServiceSettings,
    requested: String,
    local_addr: SocketAddr,
    /// Dropped once accepting stops, so an abandoned port closes.
    listener: Option<BoundListener>,
    started_at: SystemTime,
    signals: Signals,
    inflight: InflightTracker,
    accepting: Option<JoinHandle<()>>,
    connections: TaskTracker,
}

impl ServiceInstance {
    /// Bind `settings.bind_address`, then start serving.
    pub async fn bind(id: u64, settings: ServiceSettings, router: Router) -> Result<Self, InstanceError> {
        let listener = BoundListener::bind(&settings.bind_address).await?;
        Self::start(id, settings, router, listener)
    }

    /// Start serving `router` on an already bound `listener`.
    pub fn start(
        id: u64,
        settings: ServiceSettings,
        router: Router,
        listener: BoundListener,
    ) -> Result<Self, InstanceError> {
        let accept = listener.accept_handle()?;
        let local_addr = listener.local_addr();
        let signals = Signals {
            accept: CancellationToken::new(),
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
        };
        let inflight = InflightTracker::new();
        let connections = TaskTracker::new();

        let app = router.layer(middleware::from_fn_with_state(
            inflight.clone(),
            crate::net::inflight::track_inflight,
        ));

        let window = settings.drain_timeout.min(FIRST_REQUEST_WINDOW);
        let span = tracing::info_span!("instance", generation = id, address = %local_addr);
        let accepting = tokio::spawn(
            accept_loop(accept, app, signals.clone(), connections.clone(), window).instrument(span),
        );

        Ok(Self {
            id,
            requested: listener.requested().to_string(),
            local_addr,
            listener: Some(listener),
            settings,
            started_at: SystemTime::now(),
            signals,
            inflight,
            accepting: Some(accepting),
            connections,
        })
    }

    /// Stop taking new connections. Already accepted ones keep being served.
    ///
    /// Returns once the accept loop has exited and this instance holds no
    /// listening handle. A socket shared with a replacement stays open
    /// through the replacement's handle.
    pub async fn stop_accepting(&mut self) {
        self.signals.accept.cancel();
        if let Some(accepting) = self.accepting.take() {
            if let Err(e) = accepting.await {
                tracing::error!(generation = self.id, error = %e, "Accept loop failed");
            }
        }
        self.listener = None;
    }

    /// Stop accepting and wait up to `drain` for accepted connections.
    pub async fn stop(mut self, drain: Duration) {
        self.stop_accepting().await;
        self.signals.drain.cancel();
        self.connections.close();

        if tokio::time::timeout(drain, self.connections.wait()).await.is_ok() {
            tracing::info!(generation = self.id, address = %self.local_addr, "Instance drained");
            return;
        }

        tracing::warn!(
            generation = self.id,
            in_flight = self.inflight.active_count(),
            connections = self.connections.len(),
            drain_ms = drain.as_millis() as u64,
            "Drain timed out, aborting remaining requests"
        );
        self.signals.abort.cancel();
        self.connections.wait().await;
    }

    /// A second listening handle on this instance's socket.
    pub fn share_listener(&self) -> Result<BoundListener, InstanceError> {
        let listener = self.listener.as_ref().ok_or(InstanceError::NotAccepting(self.id))?;
        Ok(listener.share()?)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address as configured, before resolution.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn in_flight(&self) -> u64 {
        self.inflight.active_count()
    }

    /// Open connections, including idle keep-alive ones.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    signals: Signals,
    connections: TaskTracker,
    window: Duration,
) {
    tracing::info!("Instance serving");
    loop {
        let (stream, peer) = tokio::select! {
            _ = signals.accept.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let span = tracing::debug_span!("connection", peer = %peer);
        connections.spawn(serve_connection(stream, app.clone(), signals.clone(), window).instrument(span));
    }
    tracing::info!("Instance stopped accepting");
}

async fn serve_connection(stream: TcpStream, app: Router, signals: Signals, window: Duration) {
    // Holds a permit once any request has arrived on this connection.
    let requested = Arc::new(Notify::new());
    let service = {
        let requested = Arc::clone(&requested);
        service_fn(move |request: hyper::Request<Incoming>| {
            requested.notify_one();
            app.clone().oneshot(request)
        })
    };

    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => return closed(result),
        _ = signals.drain.cancelled() => {}
    }

    // A connection accepted just before the drain may not have sent its
    // request yet; shutting it down now would close it unanswered.
    tokio::select! {
        result = conn.as_mut() => return closed(result),
        _ = requested.notified() => {}
        _ = tokio::time::sleep(window) => {}
        _ = signals.abort.cancelled() => return,
    }

    conn.as_mut().graceful_shutdown();
    tokio::select! {
        result = conn.as_mut() => closed(result),
        _ = signals.abort.cancelled() => tracing::debug!("Connection aborted"),
    }
}

fn closed(result: Result<(), BoxError>) {
    if let Err(e) = result {
        tracing::debug!(error = %e, "Connection closed with error");
    }
}

/// Run a route builder, turning a panic into [`InstanceError::Routes`].
pub(crate) fn build_routes<F>(build: F) -> Result<Router, InstanceError>
where
    F: FnOnce() -> Router,
{
    std::panic::catch_unwind(AssertUnwindSafe(build)).map_err(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "route builder panicked".to_string());
        InstanceError::Routes(reason)
    })
}
