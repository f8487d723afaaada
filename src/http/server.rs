//! Router assembly for one serving instance.
//!
//! # Responsibilities
//! - Carry per-instance state (config snapshot, settings) into handlers
//! - Wrap application routes in the response pipeline
//!
//! # Layer order (outermost first)
//! ```text
//! set request id → trace → propagate request id → cors
//!     → body limit → timeout → dispatch → catch_panic → routes
//! ```

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigSnapshot, ServiceSettings, SharedSnapshot};
use crate::http::cors::cors;
use crate::http::dispatch::dispatch;
use crate::http::error::ErrorClassifier;
use crate::http::recovery::catch_panic;
use crate::http::request::UuidRequestId;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedSnapshot,
    pub settings: Arc<ServiceSettings>,
    pub namespace: Arc<str>,
}

impl AppState {
    pub fn new(config: SharedSnapshot, namespace: &str, settings: ServiceSettings) -> Self {
        Self {
            config,
            settings: Arc::new(settings),
            namespace: Arc::from(namespace),
        }
    }

    /// Current snapshot. Reflects watch deltas without a reload.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config.load()
    }

    /// Current value of `<namespace>/<field>`.
    pub fn setting(&self, field: &str) -> Option<String> {
        self.config.load().field(&self.namespace, field).map(str::to_string)
    }
}

/// Wrap `routes` in the response pipeline.
#[allow(deprecated)]
pub fn build_router(routes: Router, classifier: ErrorClassifier, settings: &ServiceSettings) -> Router {
    routes
        .layer(middleware::from_fn(catch_panic))
        .layer(middleware::from_fn_with_state(classifier, dispatch))
        .layer(TimeoutLayer::new(settings.request_timeout))
        .layer(RequestBodyLimitLayer::new(settings.max_body_bytes))
        .layer(middleware::from_fn(cors))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
}
