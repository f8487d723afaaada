//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Application (route sets, error registry, auth check)
//!     → each RouteSet registers into a RouteContext
//!         std:  open routes
//!         safe: routes behind the auth check
//!     → http::server wraps the merged router in the response pipeline
//!     → frozen into one ServiceInstance
//! ```
//!
//! # Design Decisions
//! - Route tables are rebuilt from scratch for every instance and never
//!   mutated afterwards
//! - Safe routes without a configured auth check are refused (401), never
//!   served open

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Router;

use crate::config::ServiceSettings;
use crate::http::error::{AppError, ErrorClassifier, ErrorRegistry};
use crate::http::server::{build_router, AppState};

/// Check run before every safe route.
pub type AuthCheck = Arc<dyn Fn(&HeaderMap) -> Result<(), AppError> + Send + Sync>;

/// A group of routes contributed by one component.
pub trait RouteSet: Send + Sync {
    fn routes(&self, ctx: &mut RouteContext);
}

/// Collects routes while an instance is being built.
#[derive(Default)]
pub struct RouteContext {
    std: Router<AppState>,
    safe: Router<AppState>,
    safe_count: usize,
}

impl RouteContext {
    /// Register an open route.
    pub fn std(&mut self, path: &str, route: MethodRouter<AppState>) -> &mut Self {
        self.std = std::mem::take(&mut self.std).route(path, route);
        self
    }

    /// Register a route behind the auth check.
    pub fn safe(&mut self, path: &str, route: MethodRouter<AppState>) -> &mut Self {
        self.safe = std::mem::take(&mut self.safe).route(path, route);
        self.safe_count += 1;
        self
    }

    fn finish(self, auth: Option<AuthCheck>) -> Router<AppState> {
        if self.safe_count == 0 {
            return self.std;
        }
        let safe = self
            .safe
            .route_layer(middleware::from_fn_with_state(auth, require_auth));
        self.std.merge(safe)
    }
}

async fn require_auth(State(auth): State<Option<AuthCheck>>, request: Request, next: Next) -> Response {
    let verdict = match &auth {
        Some(check) => check(request.headers()),
        None => Err(AppError::Unauthorized),
    };
    match verdict {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Everything needed to build a serving instance, independent of settings.
#[derive(Clone)]
pub struct Application {
    route_sets: Vec<Arc<dyn RouteSet>>,
    classifier: ErrorClassifier,
    auth: Option<AuthCheck>,
}

impl Application {
    pub fn new(registry: ErrorRegistry) -> Self {
        Self {
            route_sets: Vec::new(),
            classifier: ErrorClassifier::new(registry),
            auth: None,
        }
    }

    pub fn with_routes(mut self, routes: impl RouteSet + 'static) -> Self {
        self.route_sets.push(Arc::new(routes));
        self
    }

    pub fn with_auth<F>(mut self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> Result<(), AppError> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(check));
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Build the complete router for one instance.
    pub fn router(&self, state: AppState, settings: &ServiceSettings) -> Router {
        let mut ctx = RouteContext::default();
        for set in &self.route_sets {
            set.routes(&mut ctx);
        }
        let routes = ctx.finish(self.auth.clone()).with_state(state);
        build_router(routes, self.classifier.clone(), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSnapshot, SharedSnapshot};
    use crate::http::response::Reply;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    struct Pages;

    impl RouteSet for Pages {
        fn routes(&self, ctx: &mut RouteContext) {
            ctx.std("/public", get(|| async { Reply::data("open") }))
                .safe("/private", get(|| async { Reply::data("secret") }));
        }
    }

    fn state() -> AppState {
        AppState::new(SharedSnapshot::new(ConfigSnapshot::default()), "admin", ServiceSettings::default())
    }

    async fn status(app: Router, uri: &str, token: Option<&str>) -> StatusCode {
        let mut request = axum::http::Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header("Token", token);
        }
        app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_safe_routes_use_auth_check() {
        let app = Application::new(ErrorRegistry::default())
            .with_routes(Pages)
            .with_auth(|headers| match headers.get("Token") {
                Some(v) if v == "letmein" => Ok(()),
                Some(_) => Err(AppError::Forbidden),
                None => Err(AppError::Unauthorized),
            });
        let settings = ServiceSettings::default();

        assert_eq!(status(app.router(state(), &settings), "/public", None).await, StatusCode::OK);
        assert_eq!(status(app.router(state(), &settings), "/private", None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(app.router(state(), &settings), "/private", Some("nope")).await, StatusCode::FORBIDDEN);
        assert_eq!(status(app.router(state(), &settings), "/private", Some("letmein")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_safe_routes_without_auth_are_refused() {
        let app = Application::new(ErrorRegistry::default()).with_routes(Pages);
        let router = app.router(state(), &ServiceSettings::default());
        assert_eq!(status(router, "/private", None).await, StatusCode::UNAUTHORIZED);
    }
}
