//! Reflex schema: resolve a type identity to its resource path segment and scope using API
//! discovery, caching every group/version it has seen.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList};
use parking_lot::Mutex;
use reflex_core::{Error, GroupVersion, ResourceDescriptor, Result, TypeKey};
use reflex_kubehub::{Method, Transport, TransportResponse};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

/// Indexed at startup so the common lookups never wait on discovery.
pub const DEFAULT_GROUP_VERSIONS: [(&str, &str); 4] =
    [("", "v1"), ("apps", "v1"), ("batch", "v1"), ("apiextensions.k8s.io", "v1")];

/// Descriptors, unique by type key; group, kind and resource name point back into `by_type`.
#[derive(Default)]
struct DescriptorIndex {
    by_type: FxHashMap<TypeKey, ResourceDescriptor>,
    by_group: FxHashMap<String, FxHashSet<TypeKey>>,
    by_kind: FxHashMap<String, FxHashSet<TypeKey>>,
    by_resource: FxHashMap<String, FxHashSet<TypeKey>>,
}

impl DescriptorIndex {
    fn insert(&mut self, d: ResourceDescriptor) {
        let key = d.type_key();
        self.by_group.entry(d.group.clone()).or_default().insert(key.clone());
        self.by_kind.entry(d.kind.clone()).or_default().insert(key.clone());
        self.by_resource.entry(d.resource_name.clone()).or_default().insert(key.clone());
        self.by_type.insert(key, d);
    }

    fn collect(&self, keys: Option<&FxHashSet<TypeKey>>) -> Vec<ResourceDescriptor> {
        let mut out: Vec<ResourceDescriptor> = keys
            .map(|ks| ks.iter().filter_map(|k| self.by_type.get(k).cloned()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.type_key().cmp(&b.type_key()));
        out
    }
}

#[derive(Default)]
struct State {
    api_groups: Option<APIGroupList>,
    group_versions: FxHashSet<GroupVersion>,
    group_resources: FxHashMap<GroupVersion, APIResourceList>,
    index: DescriptorIndex,
}

/// Discovery-backed resolver. Lookups that hit the index never touch the network; the lock is
/// only held between awaits.
pub struct SchemaResolver {
    transport: Arc<dyn Transport>,
    preindex: Mutex<Vec<GroupVersion>>,
    state: Mutex<State>,
}

impl SchemaResolver {
    pub fn new(transport: Arc<dyn Transport>, preindex: Vec<GroupVersion>) -> Self {
        Self { transport, preindex: Mutex::new(preindex), state: Mutex::new(State::default()) }
    }

    /// Build and pre-index in one step.
    pub async fn connect(transport: Arc<dyn Transport>, preindex: Vec<GroupVersion>) -> Self {
        let resolver = Self::new(transport, preindex);
        resolver.warm_up().await;
        resolver
    }

    /// Fetch the group list, then index the configured group/versions followed by the defaults.
    /// Failures are logged and skipped.
    pub async fn warm_up(&self) {
        if let Err(e) = self.api_groups(true).await {
            warn!(error = %e, "api group discovery failed");
        }
        let mut targets = self.preindex.lock().clone();
        for (g, v) in DEFAULT_GROUP_VERSIONS {
            let gv = GroupVersion::new(g, v);
            let group_indexed = self.state.lock().index.by_group.contains_key(&gv.group);
            if !group_indexed && !targets.contains(&gv) {
                targets.push(gv);
            }
        }
        for gv in targets.iter() {
            match self.group_resources(gv, false).await {
                Ok(list) => debug!(gv = %gv, resources = list.resources.len(), "pre-indexed"),
                Err(e) => warn!(gv = %gv, error = %e, "pre-index failed"),
            }
        }
        info!(types = self.state.lock().index.by_type.len(), "schema resolver ready");
    }

    /// Index `gv` now and include it in later warm-ups.
    pub async fn add_group_version(&self, gv: GroupVersion) -> Result<()> {
        {
            let mut pre = self.preindex.lock();
            if !pre.contains(&gv) {
                pre.push(gv.clone());
            }
        }
        self.group_resources(&gv, false).await.map(|_| ())
    }

    /// Descriptor for `key`, fetching its group/version's resource list on a miss.
    pub async fn resolve_type(&self, key: &TypeKey) -> Result<ResourceDescriptor> {
        if let Some(d) = self.cached(key) {
            return Ok(d);
        }
        self.group_resources(&key.group_version(), true).await?;
        self.cached(key).ok_or_else(|| Error::TypeNotFound(key.canonical()))
    }

    pub async fn resource_name(&self, key: &TypeKey) -> Result<String> {
        Ok(self.resolve_type(key).await?.resource_name)
    }

    /// Index lookup only.
    pub fn cached(&self, key: &TypeKey) -> Option<ResourceDescriptor> {
        self.state.lock().index.by_type.get(key).cloned()
    }

    /// The `/apis` group list. Refetched when forced or when fewer than two groups are cached.
    pub async fn api_groups(&self, force: bool) -> Result<APIGroupList> {
        if !force {
            if let Some(groups) = self.state.lock().api_groups.as_ref() {
                if groups.groups.len() >= 2 {
                    return Ok(groups.clone());
                }
            }
        }
        let resp = self.fetch("/apis", "groups").await?;
        if !resp.is_success() {
            return Err(Error::Status { status: resp.status, path: "/apis".into() });
        }
        let groups: APIGroupList = resp.json("APIGroupList")?;
        let mut state = self.state.lock();
        state.group_versions = groups
            .groups
            .iter()
            .flat_map(|g| g.versions.iter().map(move |v| GroupVersion::new(&g.name, &v.version)))
            .collect();
        debug!(groups = groups.groups.len(), versions = state.group_versions.len(), "api groups refreshed");
        state.api_groups = Some(groups.clone());
        Ok(groups)
    }

    /// Resource list of `gv`. Served from cache unless forced; an uncached group/version must be
    /// known to discovery before it is fetched.
    pub async fn group_resources(&self, gv: &GroupVersion, force: bool) -> Result<APIResourceList> {
        if !force {
            if let Some(list) = self.state.lock().group_resources.get(gv) {
                return Ok(list.clone());
            }
            if !self.has_group_version(gv).await {
                return Err(Error::GroupVersionNotFound(gv.canonical()));
            }
        }
        let path = gv.api_path();
        let resp = self.fetch(&path, "resources").await?;
        match resp.status {
            404 => return Err(Error::GroupVersionNotFound(gv.canonical())),
            s if !(200..300).contains(&s) => return Err(Error::Status { status: s, path }),
            _ => {}
        }
        let list: APIResourceList = resp.json("APIResourceList")?;
        let mut state = self.state.lock();
        let mut indexed = 0usize;
        for r in list.resources.iter() {
            // `pods/status`, `deployments/scale`, ...
            if r.name.contains('/') {
                continue;
            }
            state.index.insert(ResourceDescriptor {
                group: gv.group.clone(),
                version: gv.version.clone(),
                kind: r.kind.clone(),
                resource_name: r.name.clone(),
                namespaced: r.namespaced,
            });
            indexed += 1;
        }
        state.group_versions.insert(gv.clone());
        state.group_resources.insert(gv.clone(), list.clone());
        debug!(gv = %gv, indexed, "group resources indexed");
        Ok(list)
    }

    /// The core group always exists. Others are checked against the group list, refreshed once
    /// when the answer is not already known.
    pub async fn has_group_version(&self, gv: &GroupVersion) -> bool {
        if gv.is_core() || self.state.lock().group_versions.contains(gv) {
            return true;
        }
        match self.api_groups(true).await {
            Ok(_) => self.state.lock().group_versions.contains(gv),
            Err(e) => {
                warn!(gv = %gv, error = %e, "group version check failed");
                false
            }
        }
    }

    pub fn search_by_kind(&self, kind: &str) -> Vec<ResourceDescriptor> {
        let state = self.state.lock();
        state.index.collect(state.index.by_kind.get(kind))
    }

    pub fn search_by_group(&self, group: &str) -> Vec<ResourceDescriptor> {
        let group = if group == reflex_core::CORE_GROUP { "" } else { group };
        let state = self.state.lock();
        state.index.collect(state.index.by_group.get(group))
    }

    pub fn search_by_resource_name(&self, name: &str) -> Vec<ResourceDescriptor> {
        let state = self.state.lock();
        state.index.collect(state.index.by_resource.get(name))
    }

    /// Every indexed group/version, sorted.
    pub fn indexed_group_versions(&self) -> Vec<GroupVersion> {
        let mut out: Vec<GroupVersion> = self.state.lock().group_resources.keys().cloned().collect();
        out.sort();
        out
    }

    async fn fetch(&self, path: &str, what: &'static str) -> Result<TransportResponse> {
        metrics::counter!("discovery_requests_total", 1u64, "kind" => what);
        self.transport.request_once(path, Method::GET).await
    }
}
