//! Stored form of one object.

use std::sync::Arc;

use reflex_core::{object, ResourceObject, Uid};
use rustc_hash::FxHashMap;

/// An object plus the lookup tables derived from it. Rebuilt on every insert or update.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub object: Arc<ResourceObject>,
    pub uid: Uid,
    pub name: String,
    /// `""` for cluster-scoped objects.
    pub namespace: String,
    pub labels: FxHashMap<String, String>,
    pub annotations: FxHashMap<String, String>,
}

impl CacheEntry {
    /// `None` when `metadata.uid` or `metadata.name` is missing.
    pub fn new(obj: ResourceObject) -> Option<Self> {
        let uid: Uid = Arc::from(object::uid(&obj)?);
        let name = object::name(&obj)?.to_string();
        let namespace = object::namespace(&obj).unwrap_or("").to_string();
        let labels = object::labels(&obj);
        let annotations = object::annotations(&obj);
        Some(Self { object: Arc::new(obj), uid, name, namespace, labels, annotations })
    }

    pub fn sort_key(&self) -> (&str, &str) { (&self.namespace, &self.name) }
}
