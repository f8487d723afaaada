//! Response dispatcher.
//!
//! Runs after the handler (and the panic guard) and turns the [`Outcome`]
//! left in the response extensions into the final status and body. Responses
//! without an outcome (router 404/405, timeouts, body limits) pass through
//! untouched.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;

use crate::http::error::{ErrorClassifier, RequestInfo};
use crate::http::request::request_id;
use crate::http::response::{Failure, Outcome, ResponseEnvelope};
use crate::observability::metrics;

/// Middleware rendering handler outcomes.
pub async fn dispatch(State(classifier): State<ErrorClassifier>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let info = RequestInfo {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        request_id: request_id(request.headers()).map(str::to_string),
    };

    let response = next.run(request).await;
    let response = render(&classifier, response, &info);

    let status = response.status();
    if status.is_server_error() {
        tracing::warn!(method = %info.method, path = %info.path, status = status.as_u16(), "Request failed");
    } else {
        tracing::debug!(method = %info.method, path = %info.path, status = status.as_u16(), "Request served");
    }
    metrics::record_request(info.method.as_str(), status.as_u16(), start);
    response
}

/// Resolve the outcome attached to `response`, if any.
pub fn render(classifier: &ErrorClassifier, mut response: Response, info: &RequestInfo) -> Response {
    let Some(outcome) = response.extensions_mut().remove::<Outcome>() else {
        return response;
    };

    let (status, body) = match outcome {
        Outcome::Raw(value) => (StatusCode::OK, to_json(&value)),
        Outcome::Enveloped { status, envelope } => (status, to_json(&envelope)),
        Outcome::Failure(failure) => {
            let classified = classifier.classify(failure, info);
            let envelope = ResponseEnvelope::failure(classified.code, classified.message, classified.detail);
            (classified.status, to_json(&envelope))
        }
    };

    let (mut parts, _) = response.into_parts();
    let (status, body) = match body {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            // Only reachable for values serde_json cannot encode as text.
            let classified = classifier.classify(Failure::Internal(Arc::new(e)), info);
            let envelope = ResponseEnvelope::failure(classified.code, classified.message, "");
            (classified.status, to_json(&envelope).unwrap_or_default())
        }
    };

    parts.status = status;
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Response::from_parts(parts, Body::from(body))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::{AppError, ErrorRegistry};
    use crate::http::response::Reply;
    use axum::response::IntoResponse;
    use serde_json::{json, Value};

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(ErrorRegistry::builder().register(1001, "bad credentials").build().unwrap())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_raw_reply_is_verbatim() {
        let response = render(&classifier(), Reply::raw(json!([1, 2])).into_response(), &RequestInfo::default());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_business_error_variants() {
        let soft = render(&classifier(), Reply::soft(1001).into_response(), &RequestInfo::default());
        assert_eq!(soft.status(), StatusCode::OK);
        assert_eq!(body_json(soft).await, json!({"code": 1001, "msg": "bad credentials"}));

        let hard = render(&classifier(), AppError::hard(1001).into_response(), &RequestInfo::default());
        assert_eq!(hard.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(hard).await, json!({"code": 1001, "msg": "bad credentials"}));
    }

    #[tokio::test]
    async fn test_auth_failures() {
        let response = render(&classifier(), Reply::unauthorized().into_response(), &RequestInfo::default());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({"code": 401, "msg": "unauthorized"}));

        let response = render(&classifier(), AppError::Forbidden.into_response(), &RequestInfo::default());
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_plain_responses_pass_through() {
        let original = (StatusCode::NOT_FOUND, "nope").into_response();
        let response = render(&classifier(), original, &RequestInfo::default());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(CONTENT_TYPE).map_or(true, |v| v != "application/json"));
    }

    #[tokio::test]
    async fn test_handler_headers_survive() {
        let mut pending = Reply::data("ok").into_response();
        pending.headers_mut().insert("x-cache", HeaderValue::from_static("hit"));
        let response = render(&classifier(), pending, &RequestInfo::default());
        assert_eq!(response.headers()["x-cache"], "hit");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
