//! Shared test doubles

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use serde_json::{json, Value};
use tokio::time::Instant;

use tvcache::network::{Upstream, UpstreamRequest, UpstreamResponse};
use tvcache::proxy::full_body;
use tvcache::storage::{BlobStore, MemoryBlobStore};
use tvcache::Result;

#[derive(Clone)]
pub struct Canned {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Canned {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(value: &Value) -> Self {
        let mut canned = Self::ok(serde_json::to_vec(value).unwrap());
        canned
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        canned
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

struct Step {
    until: Option<Duration>,
    canned: Canned,
}

/// Upstream double scripted per path; answers may depend on elapsed
/// (tokio) time so paused-clock tests can model a chunk appearing late
pub struct MockUpstream {
    started: Instant,
    routes: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answer `path` with `canned` from now on
    pub fn always(&self, path: &str, canned: Canned) {
        self.push(path, None, canned);
    }

    /// Answer `path` with `canned` until `until` has elapsed
    pub fn until(&self, path: &str, until: Duration, canned: Canned) {
        self.push(path, Some(until), canned);
    }

    fn push(&self, path: &str, until: Option<Duration>, canned: Canned) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(Step { until, canned });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == path).count()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        self.calls.lock().unwrap().push(request.path_and_query.clone());

        let elapsed = self.started.elapsed();
        let canned = self
            .routes
            .lock()
            .unwrap()
            .get(&request.path_and_query)
            .and_then(|steps| {
                steps
                    .iter()
                    .find(|step| step.until.map_or(true, |until| elapsed < until))
                    .map(|step| step.canned.clone())
            })
            .unwrap_or_else(|| Canned::status(404));

        let mut headers = HeaderMap::new();
        for (name, value) in &canned.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }

        Ok(UpstreamResponse {
            status: canned.status,
            headers,
            body: full_body(canned.body),
        })
    }
}

/// Blob store counting every access
#[derive(Default)]
pub struct CountingBlobStore {
    inner: MemoryBlobStore,
    accesses: AtomicUsize,
}

impl CountingBlobStore {
    pub fn accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(key).await
    }

    async fn list_prefixes(&self) -> Result<Vec<String>> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.inner.list_prefixes().await
    }
}

pub const FIND_PATH: &str = tvcache::config::DEFAULT_FIND_PATH;

/// Script the documents and the first `num_chunks` chunks of a replay
pub fn script_replay(upstream: &MockUpstream, id: &str, state: &str, num_chunks: u64) {
    let live = state == "Live";
    upstream.always(
        FIND_PATH,
        Canned::json(&json!({"replays": [{
            "_id": id,
            "created": 1_700_000_000,
            "live": live,
            "users": ["alice", "bob"],
            "gameMode": "SND",
            "friendlyName": "Santorini "
        }]})),
    );
    upstream.always(
        &format!("/replay/{id}/startDownloading?user"),
        Canned::json(&json!({"state": state, "numChunks": num_chunks, "time": 1000})),
    );
    upstream.always(
        &format!("/meta/{id}"),
        Canned::json(&json!({
            "gameMode": "SND", "mapName": "santorini", "numChunks": num_chunks, "live": live
        })),
    );
    upstream.always(
        &format!("/replay/{id}/event"),
        Canned::json(&json!({"events": [
            {"id": "cp1", "group": "checkpoint", "data": {"type": "Buffer", "data": [1, 2, 3]}},
            {"id": "cp2", "group": "checkpoint", "data": {"type": "Buffer", "data": [9]}}
        ]})),
    );
    upstream.always(
        &format!("/replay/{id}/event?group=Pavlov"),
        Canned::json(&json!({"events": [
            {"id": "kill1", "group": "Pavlov", "data": {"data": "headshot"}}
        ]})),
    );
    upstream.always(
        &format!("/replay/{id}/file/replay.header"),
        Canned::ok(&b"HEADER"[..]),
    );
    for index in 0..num_chunks {
        upstream.always(&chunk_path(id, index), chunk(index, index, state));
    }
}

pub fn chunk_path(id: &str, index: u64) -> String {
    format!("/replay/{id}/file/stream.{index}")
}

/// Chunk response carrying the given reported chunk count and state
pub fn chunk(index: u64, numchunks: u64, state: &str) -> Canned {
    Canned::ok(format!("chunk-{index}"))
        .header("numchunks", &numchunks.to_string())
        .header("time", &(numchunks * 1000).to_string())
        .header("state", state)
        .header("mtime1", &format!("2024-01-01T00:00:0{}Z", index % 10))
        .header("mtime2", "0")
}
