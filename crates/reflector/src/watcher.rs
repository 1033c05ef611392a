//! List-then-watch for one resource type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reflex_core::{
    EventType, Error, LabelQuery, ObjectQuery, ResourceDescriptor, ResourceObject, Result, TypeKey, WatchEvent,
};
use reflex_kubehub::{with_query, ByteStream, Method, Transport};
use reflex_schema::SchemaResolver;
use reflex_store::ResourceCache;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lines::LineBuffer;
use crate::notifier::Notifier;

/// Request shaping for a watcher.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Only applied to namespaced types.
    pub namespace: Option<String>,
    /// Sent as the field selector `metadata.name=<name>`.
    pub name: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
    pub extra_params: Vec<(String, String)>,
    /// Pause between failed relists during a resync.
    pub resync_retry_delay: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            name: None,
            field_selector: None,
            label_selector: None,
            extra_params: Vec::new(),
            resync_retry_delay: Duration::from_secs(1),
        }
    }
}

impl WatcherOptions {
    /// Collection path plus filter query for `desc`.
    pub fn list_path(&self, desc: &ResourceDescriptor) -> String {
        let base = desc.collection_path(self.namespace.as_deref());
        let mut fields: Vec<String> = Vec::new();
        if let Some(name) = self.name.as_deref() {
            fields.push(format!("metadata.name={}", name));
        }
        if let Some(fs) = self.field_selector.as_deref().filter(|s| !s.is_empty()) {
            fields.push(fs.to_string());
        }
        let field_selector = fields.join(",");
        let mut params: Vec<(&str, &str)> = Vec::new();
        if !field_selector.is_empty() {
            params.push(("fieldSelector", field_selector.as_str()));
        }
        if let Some(ls) = self.label_selector.as_deref().filter(|s| !s.is_empty()) {
            params.push(("labelSelector", ls));
        }
        for (k, v) in self.extra_params.iter() {
            params.push((k.as_str(), v.as_str()));
        }
        with_query(&base, &params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Listing,
    Watching,
    Resyncing,
    Stopped,
}

#[derive(Deserialize)]
struct ListBody {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Option<Vec<ResourceObject>>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: String,
}

struct Inner {
    type_key: TypeKey,
    options: WatcherOptions,
    transport: Arc<dyn Transport>,
    resolver: Arc<SchemaResolver>,
    cache: Mutex<ResourceCache>,
    state: watch::Sender<WatcherState>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    /// Held for the whole of `start`, so at most one session is ever spawned.
    starting: tokio::sync::Mutex<()>,
}

/// Keeps the cache of one type in step with the API server: list, then watch from the list's
/// resourceVersion, and on any disruption clear and start over.
pub struct ResourceWatcher {
    inner: Arc<Inner>,
}

impl ResourceWatcher {
    pub fn new(
        type_key: TypeKey,
        options: WatcherOptions,
        transport: Arc<dyn Transport>,
        resolver: Arc<SchemaResolver>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Created);
        let cache = Mutex::new(ResourceCache::new(type_key.clone()));
        Self {
            inner: Arc::new(Inner {
                type_key,
                options,
                transport,
                resolver,
                cache,
                state,
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                starting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn type_key(&self) -> &TypeKey { &self.inner.type_key }
    pub fn options(&self) -> &WatcherOptions { &self.inner.options }
    pub fn state(&self) -> WatcherState { *self.inner.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> { self.inner.state.subscribe() }

    /// Resolve the type, list it into the cache, open the watch and hand the stream to a
    /// background task. On error nothing is running and the state is back to `Created`.
    /// Concurrent callers wait for the one in progress; only a failed start is attempted again.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _starting = inner.starting.lock().await;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.state() != WatcherState::Created {
            return Ok(());
        }
        let desc = inner.resolver.resolve_type(&inner.type_key).await?;
        let path = inner.options.list_path(&desc);
        inner.set_state(WatcherState::Listing);
        let stream = match inner.list_and_watch(&path).await {
            Ok(s) => s,
            Err(e) => {
                inner.cache.lock().clear();
                inner.set_state(WatcherState::Created);
                return Err(e);
            }
        };
        inner.set_state(WatcherState::Watching);
        tokio::spawn(inner.clone().run(path, stream));
        Ok(())
    }

    /// Stop watching. Lines already split from a received chunk may still be applied.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.state.send_replace(WatcherState::Stopped);
        info!(gvk = %self.inner.type_key, "watcher stopped");
    }

    /// Wire the notifier's subscribed event kinds to the cache.
    pub fn register_notifier(&self, notifier: Arc<dyn Notifier>) { wire(&mut self.inner.cache.lock(), notifier) }

    /// Register `notifier` and return the objects cached at that moment, under one lock: every
    /// later change reaches the notifier and nothing earlier does.
    pub fn subscribe_with_snapshot(&self, notifier: Arc<dyn Notifier>) -> Vec<Arc<ResourceObject>> {
        let mut cache = self.inner.cache.lock();
        let snapshot = cache.list();
        wire(&mut cache, notifier);
        snapshot
    }

    pub fn list(&self) -> Vec<Arc<ResourceObject>> { self.inner.cache.lock().list() }

    pub fn query(&self, q: &ObjectQuery) -> Result<Vec<Arc<ResourceObject>>> { self.inner.cache.lock().search_objects(q) }

    pub fn query_by_label_annotation(&self, q: &LabelQuery) -> Vec<Arc<ResourceObject>> {
        self.inner.cache.lock().search_by_label_selector(q)
    }

    pub fn cached_objects_count(&self) -> usize { self.inner.cache.lock().len() }

    pub fn add_field_index(&self, path: &str) -> Result<()> { self.inner.cache.lock().add_field_index(path) }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) { self.inner.cancel.cancel() }
}

fn wire(cache: &mut ResourceCache, notifier: Arc<dyn Notifier>) {
    if notifier.subscribing_event(EventType::Added) {
        let n = notifier.clone();
        cache.on_added(move |o| n.notify_object_add(o));
    }
    if notifier.subscribing_event(EventType::Modified) {
        let n = notifier.clone();
        cache.on_modified(move |old, new| n.notify_object_modify(old, new));
    }
    if notifier.subscribing_event(EventType::Deleted) {
        cache.on_deleted(move |o| notifier.notify_object_delete(o));
    }
}

impl Inner {
    fn is_stopped(&self) -> bool { self.stopped.load(Ordering::SeqCst) }

    /// `Stopped` is final.
    fn set_state(&self, s: WatcherState) {
        if self.is_stopped() {
            return;
        }
        self.state.send_replace(s);
    }

    async fn list_and_watch(&self, path: &str) -> Result<ByteStream> {
        let resp = self.transport.request_once(path, Method::GET).await?;
        if !resp.is_success() {
            return Err(Error::Status { status: resp.status, path: path.to_string() });
        }
        let list: ListBody = resp.json("list response")?;
        let rv = list.metadata.resource_version;
        let stored = self.cache.lock().add_objects(true, list.items.unwrap_or_default());
        info!(gvk = %self.type_key, objects = stored, resource_version = %rv, "listed");

        let watch_path = with_query(path, &[("watch", "true"), ("resourceVersion", rv.as_str()), ("timeoutSeconds", "0")]);
        self.transport.open_watch_stream(&watch_path).await
    }

    async fn run(self: Arc<Self>, path: String, mut stream: ByteStream) {
        loop {
            let mut lines = LineBuffer::new();
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(gvk = %self.type_key, "watch loop cancelled");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(chunk)) => {
                            for line in lines.push(&chunk) {
                                self.dispatch(&line);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(gvk = %self.type_key, error = %e, "watch stream error");
                            break;
                        }
                        None => {
                            info!(gvk = %self.type_key, pending = lines.pending(), "watch stream closed");
                            break;
                        }
                    }
                }
            }
            match self.resync(&path).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Clear the cache and list+watch again. Relist failures retry after the configured delay.
    /// `None` once stopped.
    async fn resync(&self, path: &str) -> Option<ByteStream> {
        loop {
            if self.is_stopped() {
                return None;
            }
            metrics::counter!("watch_resyncs_total", 1u64, "gvk" => self.type_key.canonical());
            self.set_state(WatcherState::Resyncing);
            self.cache.lock().clear();
            self.set_state(WatcherState::Listing);
            match self.list_and_watch(path).await {
                Ok(stream) => {
                    self.set_state(WatcherState::Watching);
                    return Some(stream);
                }
                Err(e) => {
                    let delay = self.options.resync_retry_delay;
                    warn!(gvk = %self.type_key, error = %e, retry_in = ?delay, "relist failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, line: &[u8]) {
        let ev: WatchEvent = match serde_json::from_slice(line) {
            Ok(ev) => ev,
            Err(e) => {
                metrics::counter!("watch_malformed_lines_total", 1u64, "gvk" => self.type_key.canonical());
                warn!(gvk = %self.type_key, error = %e, bytes = line.len(), "malformed watch line dropped");
                return;
            }
        };
        let kind = ev.event_type();
        metrics::counter!("watch_events_total", 1u64, "event" => event_label(kind));
        let Some(kind) = kind else {
            warn!(gvk = %self.type_key, event = %ev.kind, "unrecognized watch event dropped");
            return;
        };
        let mut cache = self.cache.lock();
        match kind {
            EventType::Added => {
                cache.add_objects(false, [ev.object]);
            }
            EventType::Modified => {
                cache.modify_object(ev.object);
            }
            EventType::Deleted => {
                cache.delete_object(&ev.object);
            }
        }
    }
}

/// Metric label for a watch event; anything outside ADDED/MODIFIED/DELETED is `unknown`.
fn event_label(kind: Option<EventType>) -> &'static str { kind.map(|k| k.as_str()).unwrap_or("unknown") }
