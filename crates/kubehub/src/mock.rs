//! Scripted in-memory transport for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use parking_lot::Mutex;
use reflex_core::{Error, GroupVersion, Result};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::{ByteStream, Method, Transport, TransportResponse};

/// Server side of one opened watch stream.
pub struct WatchHandle {
    pub path: String,
    tx: fmpsc::UnboundedSender<Result<Bytes>>,
}

impl WatchHandle {
    /// Push a raw chunk. Returns false once the reader is gone.
    pub fn send(&self, chunk: impl Into<Bytes>) -> bool { self.tx.unbounded_send(Ok(chunk.into())).is_ok() }

    /// Push one newline-terminated JSON record.
    pub fn send_line(&self, value: &serde_json::Value) -> bool {
        let mut line = value.to_string();
        line.push('\n');
        self.send(line)
    }

    /// Deliver a transport error; the stream ends after it.
    pub fn fail(self, reason: &str) {
        let _ = self.tx.unbounded_send(Err(Error::Transport(reason.to_string())));
    }

    pub fn close(self) {}

    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

/// Responses are keyed by path without its query string. Each path holds a queue: entries are
/// consumed in order and the last one repeats. Unscripted paths answer 404.
pub struct MockTransport {
    responses: Mutex<FxHashMap<String, VecDeque<TransportResponse>>>,
    requests: Mutex<Vec<String>>,
    watch_tx: mpsc::UnboundedSender<WatchHandle>,
    watch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchHandle>>,
    fail_watch: Mutex<bool>,
}

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

fn base_path(path: &str) -> &str { path.split_once('?').map(|(p, _)| p).unwrap_or(path) }

impl MockTransport {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        Self {
            responses: Mutex::new(FxHashMap::default()),
            requests: Mutex::new(Vec::new()),
            watch_tx,
            watch_rx: tokio::sync::Mutex::new(watch_rx),
            fail_watch: Mutex::new(false),
        }
    }

    pub fn respond(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        let resp = TransportResponse { status, headers: http::HeaderMap::new(), body: body.into() };
        self.responses.lock().entry(base_path(path).to_string()).or_default().push_back(resp);
    }

    pub fn respond_json(&self, path: &str, value: &serde_json::Value) { self.respond(path, 200, value.to_string()) }

    /// Make every subsequent `open_watch_stream` fail.
    pub fn fail_watches(&self, fail: bool) {
        *self.fail_watch.lock() = fail;
    }

    /// Every path requested so far (one-shot and watch), in order, query strings included.
    pub fn requests(&self) -> Vec<String> { self.requests.lock().clone() }

    /// Number of one-shot or watch requests whose path starts with `prefix`.
    pub fn request_count(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|p| p.starts_with(prefix)).count()
    }

    /// Wait for the next opened watch stream.
    pub async fn next_watch(&self) -> Option<WatchHandle> { self.watch_rx.lock().await.recv().await }

    fn record(&self, path: &str) { self.requests.lock().push(path.to_string()) }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request_once(&self, path: &str, _method: Method) -> Result<TransportResponse> {
        // suspend like a real round trip so concurrent callers interleave
        tokio::task::yield_now().await;
        self.record(path);
        let mut map = self.responses.lock();
        match map.get_mut(base_path(path)) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap_or_default()),
            Some(queue) => Ok(queue.front().cloned().unwrap_or_default()),
            None => Ok(TransportResponse { status: 404, headers: http::HeaderMap::new(), body: Bytes::from_static(b"not found") }),
        }
    }

    async fn open_watch_stream(&self, path: &str) -> Result<ByteStream> {
        tokio::task::yield_now().await;
        self.record(path);
        if *self.fail_watch.lock() {
            return Err(Error::Transport(format!("watch refused: {}", path)));
        }
        let (tx, rx) = fmpsc::unbounded();
        let _ = self.watch_tx.send(WatchHandle { path: path.to_string(), tx });
        Ok(rx.boxed())
    }
}

/// `APIResourceList` body for `gv`; each entry is `(resource name, kind, namespaced)`.
pub fn api_resource_list(gv: &GroupVersion, resources: &[(&str, &str, bool)]) -> serde_json::Value {
    let list = APIResourceList {
        group_version: gv.canonical(),
        resources: resources
            .iter()
            .map(|(name, kind, namespaced)| APIResource {
                name: name.to_string(),
                singular_name: String::new(),
                kind: kind.to_string(),
                namespaced: *namespaced,
                verbs: vec!["get".into(), "list".into(), "watch".into()],
                ..Default::default()
            })
            .collect(),
    };
    serde_json::to_value(&list).unwrap_or_default()
}

/// `APIGroupList` body (`/apis`) listing the given non-core group/versions.
pub fn api_group_list(gvs: &[GroupVersion]) -> serde_json::Value {
    let mut groups: Vec<APIGroup> = Vec::new();
    for gv in gvs.iter().filter(|gv| !gv.is_core()) {
        let entry = GroupVersionForDiscovery { group_version: gv.canonical(), version: gv.version.clone() };
        match groups.iter_mut().find(|g| g.name == gv.group) {
            Some(g) => g.versions.push(entry),
            None => groups.push(APIGroup {
                name: gv.group.clone(),
                preferred_version: Some(entry.clone()),
                versions: vec![entry],
                ..Default::default()
            }),
        }
    }
    serde_json::to_value(&APIGroupList { groups }).unwrap_or_default()
}
