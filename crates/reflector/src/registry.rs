//! One running watcher per resource type.

use std::sync::Arc;

use parking_lot::Mutex;
use reflex_core::{object, QueryParams, ResourceObject, Result, TypeKey};
use reflex_kubehub::Transport;
use reflex_schema::SchemaResolver;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::watcher::{ResourceWatcher, WatcherOptions};

type CreationLock = Arc<tokio::sync::Mutex<()>>;

/// A caller's hold on the per-key creation lock. On drop, whatever the outcome, the map entry
/// goes away once no other caller holds it. Clones are only taken under the map lock, so a
/// count of two (map plus this slot) means nobody else is waiting.
struct CreationSlot<'a> {
    creating: &'a Mutex<FxHashMap<String, CreationLock>>,
    key: String,
    lock: CreationLock,
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        let mut creating = self.creating.lock();
        let last = creating
            .get(&self.key)
            .map(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
            .unwrap_or(false);
        if last {
            creating.remove(&self.key);
        }
    }
}

/// Watchers keyed by canonical type key. First-time creation of a key is serialized through a
/// per-key async lock, so concurrent callers for an unseen type share one watcher.
pub struct WatcherRegistry {
    transport: Arc<dyn Transport>,
    resolver: Arc<SchemaResolver>,
    defaults: WatcherOptions,
    watchers: Mutex<FxHashMap<String, Arc<ResourceWatcher>>>,
    creating: Mutex<FxHashMap<String, CreationLock>>,
}

impl WatcherRegistry {
    pub fn new(resolver: Arc<SchemaResolver>, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            resolver,
            defaults: WatcherOptions::default(),
            watchers: Mutex::new(FxHashMap::default()),
            creating: Mutex::new(FxHashMap::default()),
        }
    }

    /// Options used when `get_or_create` is called without any.
    pub fn with_defaults(mut self, defaults: WatcherOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn resolver(&self) -> &Arc<SchemaResolver> { &self.resolver }

    /// Existing watcher, or a new one that has completed its initial list and opened its watch.
    /// A failed start registers nothing.
    pub async fn get_or_create(&self, key: &TypeKey, options: Option<WatcherOptions>) -> Result<Arc<ResourceWatcher>> {
        if let Some(w) = self.get(key) {
            return Ok(w);
        }
        let slot = self.creation_slot(key.canonical());
        let _guard = slot.lock.lock().await;
        if let Some(w) = self.get(key) {
            debug!(gvk = %key, "watcher created by a concurrent caller");
            return Ok(w);
        }

        let options = options.unwrap_or_else(|| self.defaults.clone());
        let watcher = Arc::new(ResourceWatcher::new(key.clone(), options, self.transport.clone(), self.resolver.clone()));
        watcher.start().await?;
        self.watchers.lock().insert(slot.key.clone(), watcher.clone());
        info!(gvk = %key, objects = watcher.cached_objects_count(), "watcher registered");
        Ok(watcher)
    }

    fn creation_slot(&self, key: String) -> CreationSlot<'_> {
        let lock = self.creating.lock().entry(key.clone()).or_default().clone();
        CreationSlot { creating: &self.creating, key, lock }
    }

    pub fn get(&self, key: &TypeKey) -> Option<Arc<ResourceWatcher>> { self.watchers.lock().get(&key.canonical()).cloned() }

    pub fn watched_types(&self) -> Vec<TypeKey> {
        let mut out: Vec<TypeKey> = self.watchers.lock().values().map(|w| w.type_key().clone()).collect();
        out.sort();
        out
    }

    /// 0 when the type is not watched.
    pub fn cached_objects_count(&self, key: &TypeKey) -> usize {
        self.get(key).map(|w| w.cached_objects_count()).unwrap_or(0)
    }

    /// Indexed query, intersected with the label/annotation scan when selectors are given and
    /// the query does not already pin one object. Starts a watcher for the type on first use.
    pub async fn query(&self, q: &QueryParams) -> Result<Vec<Arc<ResourceObject>>> {
        let watcher = self.get_or_create(&q.type_key(), None).await?;
        let hits = watcher.query(&q.object_query())?;
        if q.is_exact() || !q.has_selectors() {
            return Ok(hits);
        }
        let selected: FxHashSet<String> = watcher
            .query_by_label_annotation(&q.label_query())
            .iter()
            .filter_map(|o| object::uid(o).map(str::to_string))
            .collect();
        Ok(hits.into_iter().filter(|o| object::uid(o).map(|u| selected.contains(u)).unwrap_or(false)).collect())
    }

    /// Stop and unregister the watcher for `key`.
    pub fn remove(&self, key: &TypeKey) -> Option<Arc<ResourceWatcher>> {
        let w = self.watchers.lock().remove(&key.canonical())?;
        w.stop();
        Some(w)
    }

    pub fn stop_all(&self) {
        let drained: Vec<Arc<ResourceWatcher>> = self.watchers.lock().drain().map(|(_, w)| w).collect();
        for w in drained.iter() {
            w.stop();
        }
        info!(watchers = drained.len(), "all watchers stopped");
    }
}
