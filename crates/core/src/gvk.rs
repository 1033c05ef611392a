//! Group/Version/Kind identities and resource descriptors.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Alias accepted for the core (legacy, `/api`) group. Stored as an empty string.
pub const CORE_GROUP: &str = "core";

fn normalize_group(group: &str) -> String {
    if group == CORE_GROUP { String::new() } else { group.to_string() }
}

/// Identity of a resource type. The core group is always stored as `""`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: normalize_group(group), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind`, `core/v1/Kind` or `group/version/Kind`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(Error::InvalidTypeKey(key.to_string())),
        }
    }

    /// Build from an object's `apiVersion` (`v1` or `apps/v1`) and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let gv = GroupVersion::parse(api_version);
        Self { group: gv.group, version: gv.version, kind: kind.to_string() }
    }

    pub fn is_core(&self) -> bool { self.group.is_empty() }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion { group: self.group.clone(), version: self.version.clone() }
    }

    /// Value of `apiVersion` for objects of this type.
    pub fn api_version(&self) -> String { self.group_version().canonical() }

    /// Map key: `v1/Pod` for the core group, `apps/v1/Deployment` otherwise.
    pub fn canonical(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// An API group at a specific version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: &str, version: &str) -> Self {
        Self { group: normalize_group(group), version: version.to_string() }
    }

    /// Parse `v1`, `core/v1` or `group/version`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((group, version)) => Self::new(group, version),
            None => Self::new("", s),
        }
    }

    pub fn is_core(&self) -> bool { self.group.is_empty() }

    pub fn canonical(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Discovery root: `/api/v1` for core, `/apis/<group>/<version>` otherwise.
    pub fn api_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Where a type lives on the API server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural path segment, e.g. `pods`.
    pub resource_name: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn type_key(&self) -> TypeKey {
        TypeKey { group: self.group.clone(), version: self.version.clone(), kind: self.kind.clone() }
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion { group: self.group.clone(), version: self.version.clone() }
    }

    /// Collection path, scoped to `namespace` only when the type is namespaced.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        let root = self.group_version().api_path();
        match namespace {
            Some(ns) if self.namespaced && !ns.is_empty() => format!("{}/namespaces/{}/{}", root, ns, self.resource_name),
            _ => format!("{}/{}", root, self.resource_name),
        }
    }
}
