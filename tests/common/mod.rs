//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use serde::Deserialize;

use servekit::config::MemoryStore;
use servekit::http::server::AppState;
use servekit::http::{FieldRules, RequestSchema, Schema};
use servekit::{AppError, Application, Bind, ErrorRegistry, Reply, RouteContext, RouteSet, Supervisor};

pub const BAD_CREDENTIALS: i64 = 1001;

#[derive(Debug, Deserialize)]
pub struct HelloReq {
    pub name: String,
}

impl RequestSchema for HelloReq {
    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> =
            LazyLock::new(|| Schema::new().field(FieldRules::new("name").required_msg("name is required")));
        &SCHEMA
    }
}

/// Routes exercising every kind of handler outcome.
pub struct Greeter;

impl RouteSet for Greeter {
    fn routes(&self, ctx: &mut RouteContext) {
        ctx.std("/hello", post(hello))
            .std("/soft", get(|| async { Reply::soft(BAD_CREDENTIALS) }))
            .std("/hard", get(|| async { Reply::hard_detail(BAD_CREDENTIALS, "user root") }))
            .std("/raw", get(|| async { Reply::raw(serde_json::json!({"pong": true})) }))
            .std("/greeting", get(greeting))
            .std("/slow", get(slow))
            .std("/panic", get(explode))
            .std("/internal", get(internal));
    }
}

async fn hello(Bind(req): Bind<HelloReq>) -> Result<Reply, AppError> {
    if req.name == "root" {
        return Err(AppError::hard(BAD_CREDENTIALS));
    }
    Ok(Reply::data(format!("hello {}", req.name)))
}

async fn greeting(State(state): State<AppState>) -> Reply {
    Reply::data(state.setting("greeting").unwrap_or_default())
}

async fn slow() -> Reply {
    tokio::time::sleep(Duration::from_millis(300)).await;
    Reply::data("done")
}

async fn explode() -> Reply {
    let users: Vec<&str> = Vec::new();
    Reply::data(users[0])
}

async fn internal() -> Result<Reply, AppError> {
    let port: u16 = "not a port".parse()?;
    Ok(Reply::data(port))
}

pub fn registry() -> ErrorRegistry {
    ErrorRegistry::builder()
        .register(BAD_CREDENTIALS, "bad credentials")
        .build()
        .unwrap()
}

pub fn greeter_app() -> Application {
    Application::new(registry()).with_routes(Greeter)
}

pub fn memory_store(entries: &[(&str, &str)]) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_entries(
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())),
    ))
}

/// Start a supervisor for namespace "admin" on a loopback port.
pub async fn start_supervisor(store: Arc<MemoryStore>) -> (Arc<Supervisor>, SocketAddr) {
    let supervisor = Arc::new(Supervisor::new(store, "admin", greeter_app()));
    let address = supervisor.start().await.unwrap();
    (supervisor, address)
}

/// A loopback address nothing listens on right now.
pub fn free_address() -> SocketAddr {
    let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    spare.local_addr().unwrap()
}

/// Client without connection reuse, so every request opens a new connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
