//! Reflex store: the in-RAM cache of one resource type.
//!
//! The primary map owns every object by uid. Namespace, name and field-path indices hold uids
//! only and are updated inside each mutating call, so they agree with the primary map whenever
//! a call returns. Change hooks run synchronously after that point, in registration order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use reflex_core::{
    intersect_sets, object, selector_matches, FieldPath, LabelQuery, ObjectQuery, ResourceObject, Result, TypeKey,
    Uid,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

mod entry;

pub use entry::CacheEntry;

pub type AddedHook = Box<dyn Fn(&Arc<ResourceObject>) + Send + Sync>;
pub type ModifiedHook = Box<dyn Fn(&Arc<ResourceObject>, &Arc<ResourceObject>) + Send + Sync>;
pub type DeletedHook = Box<dyn Fn(&Arc<ResourceObject>) + Send + Sync>;

type UidSet = FxHashSet<Uid>;

struct FieldIndex {
    path: FieldPath,
    values: FxHashMap<String, UidSet>,
}

impl FieldIndex {
    fn insert(&mut self, e: &CacheEntry) {
        self.values.entry(self.path.canonical_at(&e.object)).or_default().insert(e.uid.clone());
    }

    fn remove(&mut self, e: &CacheEntry) {
        let key = self.path.canonical_at(&e.object);
        remove_from(&mut self.values, &key, &e.uid);
    }
}

fn remove_from(map: &mut FxHashMap<String, UidSet>, key: &str, uid: &Uid) {
    if let Some(set) = map.get_mut(key) {
        set.remove(uid);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

/// Multi-indexed cache of a single resource type.
pub struct ResourceCache {
    type_key: TypeKey,
    objects: FxHashMap<Uid, CacheEntry>,
    by_namespace: FxHashMap<String, UidSet>,
    by_name: FxHashMap<String, UidSet>,
    by_field: FxHashMap<String, FieldIndex>,
    on_added: Vec<AddedHook>,
    on_modified: Vec<ModifiedHook>,
    on_deleted: Vec<DeletedHook>,
}

impl ResourceCache {
    pub fn new(type_key: TypeKey) -> Self {
        Self {
            type_key,
            objects: FxHashMap::default(),
            by_namespace: FxHashMap::default(),
            by_name: FxHashMap::default(),
            by_field: FxHashMap::default(),
            on_added: Vec::new(),
            on_modified: Vec::new(),
            on_deleted: Vec::new(),
        }
    }

    pub fn type_key(&self) -> &TypeKey { &self.type_key }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn on_added(&mut self, f: impl Fn(&Arc<ResourceObject>) + Send + Sync + 'static) { self.on_added.push(Box::new(f)) }
    pub fn on_modified(&mut self, f: impl Fn(&Arc<ResourceObject>, &Arc<ResourceObject>) + Send + Sync + 'static) {
        self.on_modified.push(Box::new(f))
    }
    pub fn on_deleted(&mut self, f: impl Fn(&Arc<ResourceObject>) + Send + Sync + 'static) { self.on_deleted.push(Box::new(f)) }

    /// Insert objects, firing ADDED for each one stored. List items carry no `apiVersion`/`kind`,
    /// so with `list_batch` those are filled in from the cache type first. Objects of another
    /// type, or without uid or name, are logged and skipped. Returns the number stored.
    pub fn add_objects(&mut self, list_batch: bool, objects: impl IntoIterator<Item = ResourceObject>) -> usize {
        let mut stored = 0usize;
        for mut obj in objects {
            if list_batch {
                self.backfill_type(&mut obj);
            }
            let Some(entry) = self.validate(obj) else { continue };
            let added = entry.object.clone();
            let (_replaced, evicted) = self.place(entry);
            self.emit_deleted(&evicted);
            for f in self.on_added.iter() {
                f(&added);
            }
            stored += 1;
        }
        self.record_size();
        stored
    }

    /// Replace the stored object with the same uid and fire MODIFIED (old, new). Unknown uids are
    /// ignored with a warning; returns whether anything changed.
    pub fn modify_object(&mut self, obj: ResourceObject) -> bool {
        let known = object::uid(&obj).map(|u| self.objects.contains_key(u)).unwrap_or(false);
        if !known {
            warn!(gvk = %self.type_key, object = %object::display_key(&obj), "modify for unknown uid ignored");
            return false;
        }
        let Some(entry) = self.validate(obj) else { return false };
        let new = entry.object.clone();
        let (replaced, evicted) = self.place(entry);
        self.emit_deleted(&evicted);
        if let Some(old) = replaced {
            for f in self.on_modified.iter() {
                f(&old.object, &new);
            }
        }
        self.record_size();
        true
    }

    /// Remove the object with the same uid and fire DELETED with the stored copy.
    pub fn delete_object(&mut self, obj: &ResourceObject) -> bool {
        let removed = object::uid(obj).and_then(|u| self.unindex(u));
        let Some(entry) = removed else {
            warn!(gvk = %self.type_key, object = %object::display_key(obj), "delete for unknown uid ignored");
            return false;
        };
        for f in self.on_deleted.iter() {
            f(&entry.object);
        }
        self.record_size();
        true
    }

    /// Build (or rebuild) the index for `path` over every stored object.
    pub fn add_field_index(&mut self, path: &str) -> Result<()> {
        let mut idx = FieldIndex { path: FieldPath::parse(path)?, values: FxHashMap::default() };
        for e in self.objects.values() {
            idx.insert(e);
        }
        debug!(gvk = %self.type_key, path = %path, values = idx.values.len(), "field index built");
        self.by_field.insert(path.to_string(), idx);
        Ok(())
    }

    pub fn field_indices(&self) -> Vec<String> {
        let mut out: Vec<String> = self.by_field.keys().cloned().collect();
        out.sort();
        out
    }

    /// Indexed lookup. A uid wins over everything else; name plus namespace is a point lookup;
    /// otherwise every present filter contributes a uid set and the sets are intersected. Field
    /// indices missing for a requested path are built on the way. No filter lists everything.
    pub fn search_objects(&mut self, q: &ObjectQuery) -> Result<Vec<Arc<ResourceObject>>> {
        if let Some(uid) = q.uid.as_deref() {
            return Ok(self.objects.get(uid).map(|e| vec![e.object.clone()]).unwrap_or_default());
        }
        if let (Some(name), Some(ns)) = (q.name.as_deref(), q.namespace.as_deref()) {
            let (Some(names), Some(nss)) = (self.by_name.get(name), self.by_namespace.get(ns)) else {
                return Ok(Vec::new());
            };
            return Ok(self.collect(intersect_sets(vec![names, nss])));
        }

        for path in q.field_matches.keys() {
            if !self.by_field.contains_key(path) {
                self.add_field_index(path)?;
            }
        }

        let empty = UidSet::default();
        let mut sets: Vec<&UidSet> = Vec::new();
        if let Some(ns) = q.namespace.as_deref() {
            sets.push(self.by_namespace.get(ns).unwrap_or(&empty));
        }
        if let Some(name) = q.name.as_deref() {
            sets.push(self.by_name.get(name).unwrap_or(&empty));
        }
        for (path, expected) in q.field_matches.iter() {
            let set = self.by_field.get(path).and_then(|idx| idx.values.get(&expected.to_string()));
            sets.push(set.unwrap_or(&empty));
        }
        if sets.is_empty() {
            return Ok(self.list());
        }
        Ok(self.collect(intersect_sets(sets)))
    }

    /// Linear scan keeping objects whose labels and annotations satisfy both selectors.
    pub fn search_by_label_selector(&self, q: &LabelQuery) -> Vec<Arc<ResourceObject>> {
        let keep = |e: &&CacheEntry| selector_matches(&e.labels, &q.labels) && selector_matches(&e.annotations, &q.annotations);
        let mut hits: Vec<&CacheEntry> = match q.namespace.as_deref() {
            Some(ns) => self
                .by_namespace
                .get(ns)
                .map(|uids| uids.iter().filter_map(|u| self.objects.get(u)).filter(keep).collect())
                .unwrap_or_default(),
            None => self.objects.values().filter(keep).collect(),
        };
        hits.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        hits.into_iter().map(|e| e.object.clone()).collect()
    }

    /// Every object, ordered by namespace then name.
    pub fn list(&self) -> Vec<Arc<ResourceObject>> {
        let mut all: Vec<&CacheEntry> = self.objects.values().collect();
        all.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        all.into_iter().map(|e| e.object.clone()).collect()
    }

    pub fn get(&self, uid: &str) -> Option<Arc<ResourceObject>> { self.objects.get(uid).map(|e| e.object.clone()) }

    /// Drop every object and all derived state. Field index definitions and hooks stay.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.by_namespace.clear();
        self.by_name.clear();
        for idx in self.by_field.values_mut() {
            idx.values.clear();
        }
        self.record_size();
    }

    fn backfill_type(&self, obj: &mut ResourceObject) {
        if let Some(map) = obj.as_object_mut() {
            map.entry("apiVersion").or_insert_with(|| self.type_key.api_version().into());
            map.entry("kind").or_insert_with(|| self.type_key.kind.clone().into());
        }
    }

    fn validate(&self, obj: ResourceObject) -> Option<CacheEntry> {
        if object::type_key(&obj).as_ref() != Some(&self.type_key) {
            warn!(gvk = %self.type_key, object = %object::display_key(&obj), "object of another type skipped");
            return None;
        }
        let entry = CacheEntry::new(obj);
        if entry.is_none() {
            warn!(gvk = %self.type_key, "object without metadata.uid or metadata.name skipped");
        }
        entry
    }

    /// Store `entry`, dropping any entry with the same uid and any other uid holding the same
    /// namespace/name. Returns (replaced, evicted).
    fn place(&mut self, entry: CacheEntry) -> (Option<CacheEntry>, Vec<CacheEntry>) {
        let replaced = self.unindex(&entry.uid);
        let stale: Vec<Uid> = match (self.by_name.get(&entry.name), self.by_namespace.get(&entry.namespace)) {
            (Some(names), Some(nss)) => intersect_sets(vec![names, nss]),
            _ => Vec::new(),
        };
        let evicted: Vec<CacheEntry> = stale.iter().filter_map(|u| self.unindex(u)).collect();
        for e in evicted.iter() {
            debug!(gvk = %self.type_key, uid = %e.uid, name = %e.name, "stale entry evicted by name conflict");
        }
        self.index(&entry);
        self.objects.insert(entry.uid.clone(), entry);
        (replaced, evicted)
    }

    fn index(&mut self, e: &CacheEntry) {
        self.by_namespace.entry(e.namespace.clone()).or_default().insert(e.uid.clone());
        self.by_name.entry(e.name.clone()).or_default().insert(e.uid.clone());
        for idx in self.by_field.values_mut() {
            idx.insert(e);
        }
    }

    fn unindex(&mut self, uid: &str) -> Option<CacheEntry> {
        let e = self.objects.remove(uid)?;
        remove_from(&mut self.by_namespace, &e.namespace, &e.uid);
        remove_from(&mut self.by_name, &e.name, &e.uid);
        for idx in self.by_field.values_mut() {
            idx.remove(&e);
        }
        Some(e)
    }

    fn emit_deleted(&self, evicted: &[CacheEntry]) {
        for e in evicted {
            for f in self.on_deleted.iter() {
                f(&e.object);
            }
        }
    }

    fn collect(&self, uids: Vec<Uid>) -> Vec<Arc<ResourceObject>> {
        let mut hits: Vec<&CacheEntry> = uids.iter().filter_map(|u| self.objects.get(u)).collect();
        hits.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        hits.into_iter().map(|e| e.object.clone()).collect()
    }

    fn record_size(&self) {
        metrics::gauge!("cache_objects", self.objects.len() as f64, "gvk" => self.type_key.canonical());
    }
}
