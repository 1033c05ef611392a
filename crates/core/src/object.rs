//! Accessors over untyped resource objects.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::TypeKey;

/// Arbitrary resource object as received from the API server.
pub type ResourceObject = serde_json::Value;

/// `metadata.uid`, shared between the primary store and its indices.
pub type Uid = Arc<str>;

fn meta_str<'a>(obj: &'a ResourceObject, key: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

pub fn uid(obj: &ResourceObject) -> Option<&str> {
    meta_str(obj, "uid").filter(|s| !s.is_empty())
}

pub fn name(obj: &ResourceObject) -> Option<&str> {
    meta_str(obj, "name").filter(|s| !s.is_empty())
}

/// Namespace, `None` for cluster-scoped objects.
pub fn namespace(obj: &ResourceObject) -> Option<&str> {
    meta_str(obj, "namespace").filter(|s| !s.is_empty())
}

pub fn resource_version(obj: &ResourceObject) -> Option<&str> {
    meta_str(obj, "resourceVersion")
}

/// Type identity derived from `apiVersion` + `kind`.
pub fn type_key(obj: &ResourceObject) -> Option<TypeKey> {
    let api_version = obj.get("apiVersion")?.as_str()?;
    let kind = obj.get("kind")?.as_str()?;
    Some(TypeKey::from_api_version(api_version, kind))
}

/// String-valued entries of `metadata.labels`; non-string values are ignored.
pub fn labels(obj: &ResourceObject) -> FxHashMap<String, String> {
    string_map(obj, "labels")
}

pub fn annotations(obj: &ResourceObject) -> FxHashMap<String, String> {
    string_map(obj, "annotations")
}

fn string_map(obj: &ResourceObject, key: &str) -> FxHashMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `namespace/name` or just `name`, for log lines.
pub fn display_key(obj: &ResourceObject) -> String {
    let name = name(obj).unwrap_or("");
    match namespace(obj) {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}
