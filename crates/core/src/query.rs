//! Query shapes shared by the cache, the watchers and notifier filters.

use std::collections::{BTreeMap, HashSet};
use std::hash::{BuildHasher, Hash};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{object, FieldPath, ResourceObject, TypeKey};

/// Exact-match label or annotation selector (`key -> value`).
pub type Selector = BTreeMap<String, String>;

/// Field path -> expected value, compared by canonical JSON text.
pub type FieldMatches = BTreeMap<String, serde_json::Value>;

/// Indexed lookup over uid, name, namespace and field paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectQuery {
    pub uid: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub field_matches: FieldMatches,
}

impl ObjectQuery {
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn field(mut self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.field_matches.insert(path.into(), value);
        self
    }
}

/// Label/annotation scan, optionally restricted to one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelQuery {
    #[serde(default)]
    pub labels: Selector,
    #[serde(default)]
    pub annotations: Selector,
    pub namespace: Option<String>,
}

impl LabelQuery {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Every requested key must be present with an equal value; an empty selector matches anything.
pub fn selector_matches(table: &FxHashMap<String, String>, selector: &Selector) -> bool {
    selector.iter().all(|(k, v)| table.get(k) == Some(v))
}

/// Full query as accepted from API callers and notifier subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub field_matches: FieldMatches,
    #[serde(default)]
    pub label_selectors: Selector,
    #[serde(default)]
    pub annotation_selectors: Selector,
}

impl QueryParams {
    pub fn for_type(key: &TypeKey) -> Self {
        Self { group: key.group.clone(), version: key.version.clone(), kind: key.kind.clone(), ..Default::default() }
    }

    pub fn type_key(&self) -> TypeKey { TypeKey::new(&self.group, &self.version, &self.kind) }

    pub fn object_query(&self) -> ObjectQuery {
        ObjectQuery {
            uid: self.uid.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            field_matches: self.field_matches.clone(),
        }
    }

    pub fn label_query(&self) -> LabelQuery {
        LabelQuery {
            labels: self.label_selectors.clone(),
            annotations: self.annotation_selectors.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// uid, or name together with namespace, pins a single object; selectors are then ignored.
    pub fn is_exact(&self) -> bool {
        self.uid.is_some() || (self.name.is_some() && self.namespace.is_some())
    }

    pub fn has_selectors(&self) -> bool {
        !self.label_selectors.is_empty() || !self.annotation_selectors.is_empty()
    }

    /// Check a single object against every condition, without any index.
    pub fn matches(&self, obj: &ResourceObject) -> bool {
        if !self.kind.is_empty() && object::type_key(obj).as_ref() != Some(&self.type_key()) {
            return false;
        }
        if let Some(ns) = self.namespace.as_deref() {
            if object::namespace(obj).unwrap_or("") != ns {
                return false;
            }
        }
        if self.name.is_some() && object::name(obj) != self.name.as_deref() {
            return false;
        }
        if self.uid.is_some() && object::uid(obj) != self.uid.as_deref() {
            return false;
        }
        for (path, expected) in self.field_matches.iter() {
            let Ok(path) = FieldPath::parse(path) else { return false };
            match path.eval(obj) {
                Some(v) if v.to_string() == expected.to_string() => {}
                _ => return false,
            }
        }
        selector_matches(&object::labels(obj), &self.label_selectors)
            && selector_matches(&object::annotations(obj), &self.annotation_selectors)
    }
}

/// Members present in every set. Sets are ordered by descending size and the
/// smallest one drives the scan; any empty set yields an empty result.
pub fn intersect_sets<T, S>(mut sets: Vec<&HashSet<T, S>>) -> Vec<T>
where
    T: Eq + Hash + Clone,
    S: BuildHasher,
{
    if sets.iter().any(|s| s.is_empty()) {
        return Vec::new();
    }
    sets.sort_by(|a, b| b.len().cmp(&a.len()));
    let Some(smallest) = sets.pop() else { return Vec::new() };
    smallest.iter().filter(|m| sets.iter().all(|s| s.contains(*m))).cloned().collect()
}
