//! servekit demo service.
//!
//! Serves a small greeter from configuration held in the store and
//! reloads whenever the namespace changes.
//!
//! ```text
//! servekit --backend memory --seed admin/server_host=127.0.0.1:8081
//! curl -XPOST localhost:8081/hello -d '{"name":"ferris"}'
//! ```

use std::sync::LazyLock;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use servekit::config::{connect, BootstrapArgs, ConfigStore, StoreBackend};
use servekit::http::server::AppState;
use servekit::http::{Constraint, FieldRules, RequestSchema, Schema};
use servekit::lifecycle::shutdown_signal;
use servekit::observability::{init_logging, init_metrics};
use servekit::{AppError, Application, Bind, ErrorRegistry, Reply, RouteContext, RouteSet, Supervisor};

const BAD_CREDENTIALS: i64 = 1001;

#[derive(Parser)]
#[command(name = "servekit", version, about = "Configuration-driven HTTP service")]
struct Cli {
    #[command(flatten)]
    bootstrap: BootstrapArgs,

    /// Seed the memory backend with KEY=VALUE before starting.
    #[arg(long = "seed", value_parser = parse_seed)]
    seeds: Vec<(String, String)>,
}

fn parse_seed(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[derive(Debug, Deserialize)]
struct HelloReq {
    name: String,
    #[serde(default)]
    password: String,
}

impl RequestSchema for HelloReq {
    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
            Schema::new()
                .field(FieldRules::new("name").required_msg("name is required"))
                .field(FieldRules::new("password").check_msg(Constraint::MaxLen(64), "password is too long"))
        });
        &SCHEMA
    }
}

struct Greeter;

impl RouteSet for Greeter {
    fn routes(&self, ctx: &mut RouteContext) {
        ctx.std("/hello", post(hello))
            .std("/greeting", get(greeting))
            .std("/panic", get(explode))
            .safe("/whoami", get(whoami));
    }
}

async fn hello(Bind(req): Bind<HelloReq>) -> Result<Reply, AppError> {
    if req.name == "root" && req.password != "toor" {
        return Err(AppError::hard(BAD_CREDENTIALS));
    }
    Ok(Reply::data(format!("hello {}", req.name)))
}

/// Reads the live snapshot, so a change shows up without a reload.
async fn greeting(State(state): State<AppState>) -> Reply {
    Reply::data(state.setting("greeting").unwrap_or_else(|| "hello".to_string()))
}

async fn explode() -> Reply {
    let empty: Vec<u8> = Vec::new();
    Reply::data(empty[0])
}

async fn whoami(headers: HeaderMap) -> Reply {
    let token = headers.get("Token").and_then(|v| v.to_str().ok()).unwrap_or_default();
    Reply::data(token)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.bootstrap.resolve()?;

    init_logging(&config.logging)?;
    let span = tracing::info_span!("service", service = %config.logging.service_name);

    async move {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "servekit starting");

        if config.metrics.enabled {
            init_metrics(config.metrics.address.parse()?)?;
        }

        let store = connect(&config.store)?;
        if config.store.backend == StoreBackend::Memory {
            seed(store.as_ref(), &cli.seeds).await?;
        } else if !cli.seeds.is_empty() {
            tracing::warn!("--seed only applies to the memory backend, ignoring");
        }

        let registry = ErrorRegistry::builder()
            .register(BAD_CREDENTIALS, "bad credentials")
            .build()?;
        let app = Application::new(registry)
            .with_routes(Greeter)
            .with_auth(|headers| match headers.get("Token") {
                Some(_) => Ok(()),
                None => Err(AppError::Unauthorized),
            });

        let supervisor =
            Supervisor::new(store, config.store.namespace.clone(), app).with_watch_config(config.watch.clone());
        supervisor.start().await?;

        let cancel = CancellationToken::new();
        let signal = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal.cancel();
        });

        supervisor.run(cancel).await?;
        tracing::info!("Shutdown complete");
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .instrument(span)
    .await
}

async fn seed(store: &dyn ConfigStore, seeds: &[(String, String)]) -> Result<(), Box<dyn std::error::Error>> {
    for (key, value) in seeds {
        store.put(key, value).await?;
    }
    Ok(())
}
