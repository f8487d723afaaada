//! etcd v3 backend over the JSON gateway.
//!
//! # Responsibilities
//! - Translate store calls into `/v3/kv/*` gateway requests
//! - Fail over across the configured endpoints, in order
//! - Turn the `/v3/watch` response stream into ordered batches
//!
//! # Design Decisions
//! - Keys and values travel base64-encoded, as the gateway requires
//! - A prefix read/watch uses the etcd range-end convention
//!   (prefix with its last byte incremented)
//! - The watch stream carries no request timeout; only connecting is bounded

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::config::store::{
    AbortOnDrop, ConfigStore, StoreError, StoreTimeouts, Subscription, WatchBatch, WatchEvent,
    WatchTarget,
};
use crate::resilience::with_deadline;

/// etcd client speaking the v3 JSON gateway.
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    timeouts: StoreTimeouts,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventJson {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: KeyValue,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    header: Option<Header>,
    #[serde(default)]
    events: Vec<EventJson>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<Value>,
}

impl EtcdStore {
    /// Create a client for a comma-separated endpoint list
    /// (e.g. `127.0.0.1:2379,10.0.0.2:2379`).
    pub fn new(endpoints: &str, timeouts: StoreTimeouts) -> Result<Self, StoreError> {
        let endpoints = parse_endpoints(endpoints)?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.dial)
            .no_proxy()
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;

        tracing::debug!(endpoints = ?endpoints.iter().map(Url::as_str).collect::<Vec<_>>(), "etcd gateway client created");
        Ok(Self { client, endpoints, timeouts })
    }

    /// POST `body` to `path`, trying each endpoint until one answers.
    async fn call(&self, path: &str, body: Value) -> Result<reqwest::Response, StoreError> {
        let mut last_err = StoreError::Backend("no endpoints configured".into());
        for endpoint in &self.endpoints {
            let url = endpoint
                .join(path)
                .map_err(|e| StoreError::Config(format!("invalid endpoint path {path}: {e}")))?;
            match self.client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    // The gateway answered; another member will not disagree.
                    return Err(StoreError::Backend(format!("{path} returned {status}: {text}")));
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable, trying next");
                    last_err = StoreError::Backend(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    async fn range(&self, key: &[u8], range_end: Option<&[u8]>) -> Result<Vec<(String, String)>, StoreError> {
        let mut body = json!({ "key": STANDARD.encode(key) });
        if let Some(end) = range_end {
            body["range_end"] = Value::String(STANDARD.encode(end));
        }
        let resp = self.call("/v3/kv/range", body).await?;
        let parsed: RangeResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("range response: {e}")))?;
        parsed
            .kvs
            .into_iter()
            .map(|kv| -> Result<(String, String), StoreError> { Ok((decode(&kv.key)?, decode(&kv.value)?)) })
            .collect()
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_deadline("get", self.timeouts.request, async {
            let mut kvs = self.range(key.as_bytes(), None).await?;
            Ok(kvs.pop().map(|(_, v)| v))
        })
        .await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        with_deadline("get_prefix", self.timeouts.request, async {
            let end = prefix_range_end(prefix.as_bytes());
            let kvs = self.range(prefix.as_bytes(), Some(&end)).await?;
            Ok(kvs.into_iter().collect())
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        with_deadline("put", self.timeouts.request, async {
            let body = json!({ "key": STANDARD.encode(key), "value": STANDARD.encode(value) });
            self.call("/v3/kv/put", body).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_deadline("delete", self.timeouts.request, async {
            let body = json!({ "key": STANDARD.encode(key) });
            self.call("/v3/kv/deleterange", body).await?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription, StoreError> {
        let mut create = json!({ "key": STANDARD.encode(target.as_str()) });
        if let WatchTarget::Prefix(prefix) = &target {
            create["range_end"] = Value::String(STANDARD.encode(prefix_range_end(prefix.as_bytes())));
        }
        let resp = with_deadline(
            "watch",
            self.timeouts.dial,
            self.call("/v3/watch", json!({ "create_request": create })),
        )
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(StoreError::Backend(format!("watch stream: {e}"))));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_watch_line(&line) {
                        Ok(Some(batch)) => {
                            if tx.send(Ok(batch)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Err(StoreError::SubscriptionClosed));
        });

        Ok(Subscription::new(rx).with_guard(AbortOnDrop(task)))
    }
}

fn parse_endpoints(raw: &str) -> Result<Vec<Url>, StoreError> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let with_scheme = if s.contains("://") { s.to_string() } else { format!("http://{s}") };
            Url::parse(&with_scheme).map_err(|e| StoreError::Config(format!("invalid endpoint '{s}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if endpoints.is_empty() {
        return Err(StoreError::Config("no etcd endpoints configured".into()));
    }
    Ok(endpoints)
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Empty or all-0xff prefix: range over the whole key space.
    vec![0]
}

fn decode(field: &str) -> Result<String, StoreError> {
    let bytes = STANDARD
        .decode(field)
        .map_err(|e| StoreError::Protocol(format!("bad base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Protocol(format!("non UTF-8 value: {e}")))
}

/// Parse one newline-delimited gateway message into a batch.
///
/// Returns `Ok(None)` for messages without events (creation acks, progress
/// notifications).
fn parse_watch_line(line: &[u8]) -> Result<Option<WatchBatch>, StoreError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| StoreError::Protocol(format!("watch line not UTF-8: {e}")))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }

    let parsed: WatchLine =
        serde_json::from_str(text).map_err(|e| StoreError::Protocol(format!("watch line: {e}")))?;
    if let Some(err) = parsed.error {
        return Err(StoreError::Backend(format!("watch error: {err}")));
    }
    let Some(result) = parsed.result else {
        return Ok(None);
    };
    if result.canceled {
        return Err(StoreError::SubscriptionClosed);
    }
    if result.events.is_empty() {
        return Ok(None);
    }

    let revision = result
        .header
        .and_then(|h| h.revision)
        .and_then(|r| r.parse().ok())
        .unwrap_or(0);
    let events = result
        .events
        .into_iter()
        .map(|ev| -> Result<WatchEvent, StoreError> {
            let key = decode(&ev.kv.key)?;
            Ok(match ev.kind.as_deref() {
                Some("DELETE") => WatchEvent::delete(key),
                _ => WatchEvent::put(key, decode(&ev.kv.value)?),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(WatchBatch::new(revision, events)))
}
