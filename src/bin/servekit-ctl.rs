use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use servekit::config::{connect, BootstrapArgs, WatchBatch, Watcher};
use servekit::lifecycle::shutdown_signal;

#[derive(Parser)]
#[command(name = "servekit-ctl")]
#[command(about = "Inspect and edit servekit configuration", long_about = None)]
struct Cli {
    #[command(flatten)]
    bootstrap: BootstrapArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one key
    Get { key: String },
    /// Read every key under a prefix
    GetPrefix { prefix: String },
    /// Write a key
    Put { key: String, value: String },
    /// Remove a key
    Delete { key: String },
    /// Follow changes to one key
    Watch { key: String },
    /// Follow changes under a prefix
    WatchPrefix { prefix: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.bootstrap.resolve()?;
    let store = connect(&config.store)?;

    match cli.command {
        Commands::Get { key } => {
            let value = store.get(&key).await?;
            print_json(&json!({ "key": key, "value": value }))?;
        }
        Commands::GetPrefix { prefix } => {
            let entries = store.get_prefix(&prefix).await?;
            print_json(&serde_json::to_value(entries)?)?;
        }
        Commands::Put { key, value } => {
            store.put(&key, &value).await?;
            print_json(&json!({ "key": key, "value": value }))?;
        }
        Commands::Delete { key } => {
            store.delete(&key).await?;
            print_json(&json!({ "key": key, "deleted": true }))?;
        }
        Commands::Watch { key } => {
            let watcher = Watcher::from_config(store, &config.watch);
            let cancel = cancel_on_signal();
            watcher
                .watch(&key, &cancel, |key, value| {
                    let _ = print_json(&json!({ "key": key, "value": value }));
                })
                .await?;
        }
        Commands::WatchPrefix { prefix } => {
            let watcher = Watcher::from_config(store, &config.watch);
            let cancel = cancel_on_signal();
            watcher
                .watch_prefix(&prefix, &cancel, |batch: &WatchBatch| {
                    if let Ok(value) = serde_json::to_value(batch) {
                        let _ = print_json(&value);
                    }
                })
                .await?;
        }
    }

    Ok(())
}

fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });
    cancel
}

fn print_json(value: &Value) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
