//! Handler outcomes and the wire envelope.
//!
//! # Responsibilities
//! - Define the `{code, msg, detail, data}` envelope
//! - Give handlers one typed way to say what happened ([`Reply`])
//! - Carry the outcome to the dispatcher inside the response extensions
//!
//! # Design Decisions
//! - Handlers never pick status codes or envelope fields by hand; the
//!   dispatcher renders every [`Outcome`] the same way
//! - Raw and enveloped success are distinct variants, as are soft (200)
//!   and hard (400) business errors

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::error::{AppError, Severity};

/// Uniform success/error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseEnvelope {
    /// `{"code": 0, "data": ...}`
    pub fn success(data: Option<Value>) -> Self {
        Self {
            code: 0,
            msg: String::new(),
            detail: String::new(),
            data: data.filter(|v| !v.is_null()),
        }
    }

    pub fn failure(code: i64, msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            detail: detail.into(),
            data: None,
        }
    }
}

/// A failure not yet resolved against the error registry.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Registered business error; description comes from the registry.
    Business {
        code: i64,
        detail: Option<String>,
        severity: Severity,
    },
    /// Code and message chosen by the handler.
    Message {
        status: StatusCode,
        code: i64,
        message: String,
    },
    /// Request payload could not be bound or validated.
    Bind(String),
    Unauthorized,
    Forbidden,
    /// Anything else. Never shown to the client.
    Internal(Arc<dyn std::error::Error + Send + Sync>),
    /// A handler panicked.
    Panic(PanicReport),
}

/// What the panic guard learned about a panic.
#[derive(Debug, Clone, Default)]
pub struct PanicReport {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Option<String>,
}

/// Handler outcome, stored in the response extensions for the dispatcher.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Serialized verbatim with status 200.
    Raw(Value),
    Enveloped {
        status: StatusCode,
        envelope: ResponseEnvelope,
    },
    Failure(Failure),
}

impl Outcome {
    /// Wrap into an otherwise empty response for the dispatcher to render.
    pub fn into_pending_response(self) -> Response {
        let mut response = Response::new(axum::body::Body::empty());
        response.extensions_mut().insert(self);
        response
    }
}

impl From<Failure> for Outcome {
    fn from(failure: Failure) -> Self {
        Outcome::Failure(failure)
    }
}

/// Successful handler reply.
///
/// ```ignore
/// async fn hello(Bind(req): Bind<HelloReq>) -> Result<Reply, AppError> {
///     if req.name == "root" {
///         return Ok(Reply::hard(BAD_CREDENTIALS));
///     }
///     Ok(Reply::data(format!("hello {}", req.name)))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Reply(Outcome);

impl Reply {
    /// Body is `value` itself, status 200.
    pub fn raw<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Reply(Outcome::Raw(v)),
            Err(e) => Self::unserializable(e),
        }
    }

    /// `{"code": 0, "data": value}`, status 200.
    pub fn data<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::enveloped(StatusCode::OK, ResponseEnvelope::success(Some(v))),
            Err(e) => Self::unserializable(e),
        }
    }

    /// `{"code": 0}`, status 200.
    pub fn ok() -> Self {
        Self::enveloped(StatusCode::OK, ResponseEnvelope::success(None))
    }

    /// Free-form business reply with code, message and data, status 200.
    ///
    /// Any code is passed through; code 0 reads as a success carrying a
    /// message.
    pub fn biz<T: Serialize>(code: i64, msg: impl Into<String>, data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(v) => Self::enveloped(
                StatusCode::OK,
                ResponseEnvelope {
                    code,
                    msg: msg.into(),
                    detail: String::new(),
                    data: Some(v).filter(|v| !v.is_null()),
                },
            ),
            Err(e) => Self::unserializable(e),
        }
    }

    /// Registered business error inside a 200 envelope.
    pub fn soft(code: i64) -> Self {
        Self::business(code, None, Severity::Soft)
    }

    pub fn soft_detail(code: i64, detail: impl Into<String>) -> Self {
        Self::business(code, Some(detail.into()), Severity::Soft)
    }

    /// `{"code": 400, "msg": msg}` with status 200.
    pub fn soft_message(msg: impl Into<String>) -> Self {
        Self::message(StatusCode::OK, 400, msg)
    }

    /// Registered business error with status 400.
    pub fn hard(code: i64) -> Self {
        Self::business(code, None, Severity::Hard)
    }

    pub fn hard_detail(code: i64, detail: impl Into<String>) -> Self {
        Self::business(code, Some(detail.into()), Severity::Hard)
    }

    /// Unregistered code and message, status 400. Code 0 is reserved for
    /// success and becomes 400.
    pub fn bad(code: i64, msg: impl Into<String>) -> Self {
        let code = if code == 0 { 400 } else { code };
        Self::message(StatusCode::BAD_REQUEST, code, msg)
    }

    /// `{"code": 400, "msg": msg}` with status 400.
    pub fn bad_message(msg: impl Into<String>) -> Self {
        Self::message(StatusCode::BAD_REQUEST, 400, msg)
    }

    pub fn unauthorized() -> Self {
        Reply(Outcome::Failure(Failure::Unauthorized))
    }

    pub fn forbidden() -> Self {
        Reply(Outcome::Failure(Failure::Forbidden))
    }

    pub fn outcome(&self) -> &Outcome {
        &self.0
    }

    fn enveloped(status: StatusCode, envelope: ResponseEnvelope) -> Self {
        Reply(Outcome::Enveloped { status, envelope })
    }

    fn business(code: i64, detail: Option<String>, severity: Severity) -> Self {
        Reply(Outcome::Failure(Failure::Business { code, detail, severity }))
    }

    fn message(status: StatusCode, code: i64, msg: impl Into<String>) -> Self {
        Reply(Outcome::Failure(Failure::Message {
            status,
            code,
            message: msg.into(),
        }))
    }

    fn unserializable(error: serde_json::Error) -> Self {
        Reply(Outcome::Failure(Failure::Internal(Arc::new(error))))
    }
}

impl From<AppError> for Reply {
    fn from(error: AppError) -> Self {
        Reply(Outcome::Failure(error.into_failure()))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        self.0.into_pending_response()
    }
}
