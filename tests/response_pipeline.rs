//! End-to-end behaviour of the response pipeline through a full router.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use servekit::config::{ConfigSnapshot, ServiceSettings, SharedSnapshot};
use servekit::http::error::INTERNAL_MESSAGE;
use servekit::http::server::AppState;
use servekit::http::X_REQUEST_ID;

mod common;

fn router() -> Router {
    let settings = ServiceSettings::default();
    let state = AppState::new(SharedSnapshot::new(ConfigSnapshot::default()), "admin", settings.clone());
    common::greeter_app().router(state, &settings)
}

async fn call(request: Request<Body>) -> (StatusCode, Value) {
    call_on(router(), request).await
}

async fn call_on(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_values_raw_and_enveloped() {
    assert_eq!(call(get("/raw")).await, (StatusCode::OK, json!({"pong": true})));
    assert_eq!(
        call(post_json("/hello", r#"{"name":"ferris"}"#)).await,
        (StatusCode::OK, json!({"code": 0, "data": "hello ferris"}))
    );
}

#[tokio::test]
async fn test_business_error_soft_and_hard() {
    assert_eq!(
        call(get("/soft")).await,
        (StatusCode::OK, json!({"code": 1001, "msg": "bad credentials"}))
    );
    assert_eq!(
        call(get("/hard")).await,
        (StatusCode::BAD_REQUEST, json!({"code": 1001, "msg": "bad credentials", "detail": "user root"}))
    );
    assert_eq!(
        call(post_json("/hello", r#"{"name":"root"}"#)).await,
        (StatusCode::BAD_REQUEST, json!({"code": 1001, "msg": "bad credentials"}))
    );
}

#[tokio::test]
async fn test_validation_messages() {
    assert_eq!(
        call(post_json("/hello", "{}")).await,
        (StatusCode::BAD_REQUEST, json!({"code": 400, "msg": "name is required"}))
    );
    assert_eq!(
        call(post_json("/hello", r#"{"name":""}"#)).await,
        (StatusCode::BAD_REQUEST, json!({"code": 400, "msg": "name is required"}))
    );
    assert_eq!(
        call(post_json("/hello", "")).await,
        (StatusCode::BAD_REQUEST, json!({"code": 400, "msg": "request payload malformed"}))
    );

    assert_eq!(
        call(post_json("/hello", r#"{"name":null}"#)).await,
        (StatusCode::BAD_REQUEST, json!({"code": 400, "msg": "name is required"}))
    );
    assert_eq!(
        call(post_json("/hello", "[]")).await,
        (StatusCode::BAD_REQUEST, json!({"code": 400, "msg": "request payload malformed"}))
    );

    let (status, body) = call(post_json("/hello", r#"{"name":5}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["msg"], "name expects a string, got integer `5`");
}

#[tokio::test]
async fn test_panics_get_distinct_correlation_codes() {
    let router = router();
    let (first_status, first) = call_on(router.clone(), get("/panic")).await;
    let (second_status, second) = call_on(router, get("/panic")).await;

    assert_eq!(first_status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(second_status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(first["msg"], INTERNAL_MESSAGE);
    assert!(first.get("detail").is_none());

    let (a, b) = (first["code"].as_i64().unwrap(), second["code"].as_i64().unwrap());
    assert!(a > 1_000_000_000, "correlation code {a} is not clock-derived");
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_internal_error_is_hidden() {
    let (status, body) = call(get("/internal")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["msg"], INTERNAL_MESSAGE);
    assert!(!body.to_string().contains("invalid digit"));
}

#[tokio::test]
async fn test_preflight_and_cors_headers() {
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/hello")
        .body(Body::empty())
        .unwrap();
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["access-control-allow-credentials"], "true");

    let response = router().oneshot(get("/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_request_id_round_trip() {
    let response = router().oneshot(get("/raw")).await.unwrap();
    let generated = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
    assert_eq!(generated.len(), 36);

    let request = Request::get("/raw").header(X_REQUEST_ID, "req-42").body(Body::empty()).unwrap();
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.headers()[X_REQUEST_ID], "req-42");
}
