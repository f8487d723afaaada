//! Error codes and classification.
//!
//! # Responsibilities
//! - Hold the registered business error codes ([`ErrorRegistry`])
//! - Give handlers a `?`-friendly failure type ([`AppError`])
//! - Turn any [`Failure`] into status, code, message and detail
//!
//! # Design Decisions
//! - The registry is an immutable value built once at startup and shared
//!   by reference; there is no global table
//! - Internal errors and panics get a correlation code; the cause is
//!   logged under that code and never sent to the client
//! - An unregistered business code is a programming error and is
//!   reported as an internal error

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::http::response::{Failure, Outcome};
use crate::observability::metrics;

/// Message shown to clients for internal errors and panics.
pub const INTERNAL_MESSAGE: &str = "internal server error, contact the administrator";

/// Codes the pipeline itself answers with.
pub const RESERVED_CODES: [i64; 5] = [0, 400, 401, 403, 500];

/// A registered business error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("error code {code} registered twice ({first:?}, {second:?})")]
    Duplicate {
        code: i64,
        first: String,
        second: String,
    },

    #[error("error code {0} is reserved")]
    Reserved(i64),
}

/// Immutable code → description table.
#[derive(Debug, Clone, Default)]
pub struct ErrorRegistry {
    codes: HashMap<i64, ErrorCode>,
}

impl ErrorRegistry {
    pub fn builder() -> ErrorRegistryBuilder {
        ErrorRegistryBuilder::default()
    }

    pub fn lookup(&self, code: i64) -> Option<&ErrorCode> {
        self.codes.get(&code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ErrorRegistryBuilder {
    codes: HashMap<i64, ErrorCode>,
    error: Option<RegistryError>,
}

impl ErrorRegistryBuilder {
    pub fn register(mut self, code: i64, description: impl Into<String>) -> Self {
        let description = description.into();
        if self.error.is_some() {
            return self;
        }
        if RESERVED_CODES.contains(&code) {
            self.error = Some(RegistryError::Reserved(code));
            return self;
        }
        if let Some(existing) = self.codes.get(&code) {
            self.error = Some(RegistryError::Duplicate {
                code,
                first: existing.description.clone(),
                second: description,
            });
            return self;
        }
        self.codes.insert(code, ErrorCode { code, description });
        self
    }

    pub fn build(self) -> Result<ErrorRegistry, RegistryError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(ErrorRegistry { codes: self.codes }),
        }
    }
}

/// Status family of a business error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported inside a 200 envelope.
    Soft,
    /// Reported with status 400.
    Hard,
}

impl Severity {
    pub fn status(self) -> StatusCode {
        match self {
            Severity::Soft => StatusCode::OK,
            Severity::Hard => StatusCode::BAD_REQUEST,
        }
    }
}

/// Handler failure.
///
/// Any `std::error::Error` converts into [`AppError::Internal`], so `?`
/// works on library calls inside handlers.
#[derive(Debug)]
pub enum AppError {
    Business {
        code: i64,
        detail: Option<String>,
        severity: Severity,
    },
    Bind(String),
    Unauthorized,
    Forbidden,
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
    pub fn soft(code: i64) -> Self {
        AppError::Business { code, detail: None, severity: Severity::Soft }
    }

    pub fn hard(code: i64) -> Self {
        AppError::Business { code, detail: None, severity: Severity::Hard }
    }

    pub fn hard_detail(code: i64, detail: impl Into<String>) -> Self {
        AppError::Business { code, detail: Some(detail.into()), severity: Severity::Hard }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message: String = message.into();
        AppError::Internal(message.into())
    }

    pub(crate) fn into_failure(self) -> Failure {
        match self {
            AppError::Business { code, detail, severity } => Failure::Business { code, detail, severity },
            AppError::Bind(message) => Failure::Bind(message),
            AppError::Unauthorized => Failure::Unauthorized,
            AppError::Forbidden => Failure::Forbidden,
            AppError::Internal(cause) => Failure::Internal(Arc::from(cause)),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Business { code, .. } => write!(f, "business error {code}"),
            AppError::Bind(message) => write!(f, "bind error: {message}"),
            AppError::Unauthorized => f.write_str("unauthorized"),
            AppError::Forbidden => f.write_str("forbidden"),
            AppError::Internal(cause) => write!(f, "internal error: {cause}"),
        }
    }
}

impl<E> From<E> for AppError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        AppError::Internal(Box::new(error))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        Outcome::Failure(self.into_failure()).into_pending_response()
    }
}

/// Final classification of a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub code: i64,
    pub message: String,
    pub detail: String,
    pub status: StatusCode,
}

/// Strictly increasing correlation codes derived from the clock.
///
/// The code is the current unix time in seconds, bumped past the last code
/// handed out so two failures never share one.
#[derive(Debug, Default)]
pub struct CorrelationCodes {
    last: AtomicI64,
}

impl CorrelationCodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let bump = |last: i64| now.max(last + 1);
        match self.last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last))) {
            Ok(previous) | Err(previous) => bump(previous),
        }
    }
}

/// Request attributes logged alongside an internal error.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub request_id: Option<String>,
}

/// Resolves failures against the registry.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    registry: Arc<ErrorRegistry>,
    correlation: Arc<CorrelationCodes>,
}

impl ErrorClassifier {
    pub fn new(registry: ErrorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            correlation: Arc::new(CorrelationCodes::new()),
        }
    }

    pub fn registry(&self) -> &ErrorRegistry {
        &self.registry
    }

    pub fn classify(&self, failure: Failure, request: &RequestInfo) -> ClassifiedError {
        match failure {
            Failure::Business { code, detail, severity } => match self.registry.lookup(code) {
                Some(registered) => ClassifiedError {
                    code,
                    message: registered.description.clone(),
                    detail: detail.unwrap_or_default(),
                    status: severity.status(),
                },
                None => self.internal(request, &format!("unregistered business error code {code}")),
            },
            Failure::Message { status, code, message } => ClassifiedError {
                code,
                message,
                detail: String::new(),
                status,
            },
            Failure::Bind(message) => ClassifiedError {
                code: 400,
                message,
                detail: String::new(),
                status: StatusCode::BAD_REQUEST,
            },
            Failure::Unauthorized => ClassifiedError {
                code: 401,
                message: "unauthorized".to_string(),
                detail: String::new(),
                status: StatusCode::UNAUTHORIZED,
            },
            Failure::Forbidden => ClassifiedError {
                code: 403,
                message: "forbidden".to_string(),
                detail: String::new(),
                status: StatusCode::FORBIDDEN,
            },
            Failure::Internal(cause) => self.internal(request, &cause.to_string()),
            Failure::Panic(report) => {
                let correlation_code = self.correlation.next();
                metrics::record_panic();
                tracing::error!(
                    correlation_code,
                    method = %request.method,
                    path = %request.path,
                    request_id = request.request_id.as_deref().unwrap_or("-"),
                    panic = %report.message,
                    location = report.location.as_deref().unwrap_or("unknown"),
                    backtrace = report.backtrace.as_deref().unwrap_or(""),
                    "Handler panicked"
                );
                Self::opaque(correlation_code)
            }
        }
    }

    fn internal(&self, request: &RequestInfo, cause: &str) -> ClassifiedError {
        let correlation_code = self.correlation.next();
        tracing::error!(
            correlation_code,
            method = %request.method,
            path = %request.path,
            request_id = request.request_id.as_deref().unwrap_or("-"),
            error = %cause,
            "Internal error"
        );
        Self::opaque(correlation_code)
    }

    fn opaque(code: i64) -> ClassifiedError {
        ClassifiedError {
            code,
            message: INTERNAL_MESSAGE.to_string(),
            detail: String::new(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
