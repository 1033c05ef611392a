#![forbid(unsafe_code)]

use std::sync::Arc;

use reflex_core::{Error, GroupVersion, TypeKey};
use reflex_kubehub::mock::{api_group_list, api_resource_list, MockTransport};
use reflex_schema::SchemaResolver;

fn gv(g: &str, v: &str) -> GroupVersion { GroupVersion::new(g, v) }

fn cluster() -> Arc<MockTransport> {
    let t = MockTransport::new();
    t.respond_json(
        "/apis",
        &api_group_list(&[gv("apps", "v1"), gv("batch", "v1"), gv("apiextensions.k8s.io", "v1"), gv("cert-manager.io", "v1")]),
    );
    t.respond_json(
        "/api/v1",
        &api_resource_list(
            &gv("", "v1"),
            &[("pods", "Pod", true), ("pods/status", "Pod", true), ("namespaces", "Namespace", false), ("configmaps", "ConfigMap", true)],
        ),
    );
    t.respond_json(
        "/apis/apps/v1",
        &api_resource_list(&gv("apps", "v1"), &[("deployments", "Deployment", true), ("deployments/scale", "Scale", true)]),
    );
    t.respond_json("/apis/batch/v1", &api_resource_list(&gv("batch", "v1"), &[("jobs", "Job", true)]));
    t.respond_json(
        "/apis/apiextensions.k8s.io/v1",
        &api_resource_list(&gv("apiextensions.k8s.io", "v1"), &[("customresourcedefinitions", "CustomResourceDefinition", false)]),
    );
    t.respond_json(
        "/apis/cert-manager.io/v1",
        &api_resource_list(&gv("cert-manager.io", "v1"), &[("certificates", "Certificate", true)]),
    );
    Arc::new(t)
}

fn exact(t: &MockTransport, path: &str) -> usize { t.requests().iter().filter(|p| p.as_str() == path).count() }

#[tokio::test]
async fn warm_up_indexes_default_groups() {
    let t = cluster();
    let r = SchemaResolver::connect(t.clone(), vec![]).await;
    assert_eq!(exact(&t, "/apis"), 1);
    for path in ["/api/v1", "/apis/apps/v1", "/apis/batch/v1", "/apis/apiextensions.k8s.io/v1"] {
        assert_eq!(exact(&t, path), 1, "{path} should be fetched once");
    }
    assert_eq!(exact(&t, "/apis/cert-manager.io/v1"), 0);

    // served from the index
    let before = t.requests().len();
    let d = r.resolve_type(&TypeKey::new("apps", "v1", "Deployment")).await.unwrap();
    assert_eq!(d.resource_name, "deployments");
    assert!(d.namespaced);
    let ns = r.resolve_type(&TypeKey::new("core", "v1", "Namespace")).await.unwrap();
    assert!(!ns.namespaced);
    assert_eq!(t.requests().len(), before);
}

#[tokio::test]
async fn configured_group_versions_are_preindexed() {
    let t = cluster();
    let r = SchemaResolver::connect(t.clone(), vec![gv("cert-manager.io", "v1")]).await;
    assert_eq!(exact(&t, "/apis/cert-manager.io/v1"), 1);
    assert!(r.cached(&TypeKey::new("cert-manager.io", "v1", "Certificate")).is_some());
}

#[tokio::test]
async fn resolve_fetches_lazily_and_caches() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);
    let key = TypeKey::new("cert-manager.io", "v1", "Certificate");
    assert!(r.cached(&key).is_none());
    assert_eq!(r.resource_name(&key).await.unwrap(), "certificates");
    assert_eq!(r.resource_name(&key).await.unwrap(), "certificates");
    assert_eq!(exact(&t, "/apis/cert-manager.io/v1"), 1);
}

#[tokio::test]
async fn subresources_are_skipped() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);
    r.resolve_type(&TypeKey::new("", "v1", "Pod")).await.unwrap();
    assert!(r.search_by_resource_name("pods/status").is_empty());
    assert_eq!(r.search_by_kind("Pod").len(), 1);
    r.resolve_type(&TypeKey::new("apps", "v1", "Deployment")).await.unwrap();
    assert!(r.search_by_kind("Scale").is_empty());
}

#[tokio::test]
async fn unknown_kind_and_group_version() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);

    let err = r.resolve_type(&TypeKey::new("apps", "v1", "Nope")).await.unwrap_err();
    assert!(matches!(err, Error::TypeNotFound(ref k) if k == "apps/v1/Nope"), "{err}");
    // every miss goes back to discovery
    let _ = r.resolve_type(&TypeKey::new("apps", "v1", "Nope")).await;
    assert_eq!(exact(&t, "/apis/apps/v1"), 2);

    let err = r.resolve_type(&TypeKey::new("example.com", "v1", "Widget")).await.unwrap_err();
    assert!(matches!(err, Error::GroupVersionNotFound(ref gv) if gv == "example.com/v1"), "{err}");

    t.respond("/apis/broken.io/v1", 500, "oops");
    let err = r.resolve_type(&TypeKey::new("broken.io", "v1", "Thing")).await.unwrap_err();
    assert!(matches!(err, Error::Status { status: 500, .. }), "{err}");
}

#[tokio::test]
async fn group_version_checks() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);
    assert!(r.has_group_version(&gv("core", "v1")).await);
    assert!(t.requests().is_empty());

    assert!(r.has_group_version(&gv("cert-manager.io", "v1")).await);
    assert_eq!(exact(&t, "/apis"), 1);
    assert!(r.has_group_version(&gv("cert-manager.io", "v1")).await);
    assert_eq!(exact(&t, "/apis"), 1);

    assert!(!r.has_group_version(&gv("nope.io", "v1")).await);
    let err = r.group_resources(&gv("nope.io", "v1"), false).await.unwrap_err();
    assert!(matches!(err, Error::GroupVersionNotFound(_)));
    assert_eq!(exact(&t, "/apis/nope.io/v1"), 0);
}

#[tokio::test]
async fn group_list_refreshes_when_sparse() {
    let t = Arc::new(MockTransport::new());
    t.respond_json("/apis", &api_group_list(&[gv("apps", "v1")]));
    t.respond_json("/apis", &api_group_list(&[gv("apps", "v1"), gv("batch", "v1")]));
    let r = SchemaResolver::new(t.clone(), vec![]);

    assert_eq!(r.api_groups(false).await.unwrap().groups.len(), 1);
    // a single cached group is not trusted
    assert_eq!(r.api_groups(false).await.unwrap().groups.len(), 2);
    assert_eq!(r.api_groups(false).await.unwrap().groups.len(), 2);
    assert_eq!(exact(&t, "/apis"), 2);
    r.api_groups(true).await.unwrap();
    assert_eq!(exact(&t, "/apis"), 3);
}

#[tokio::test]
async fn group_resources_cache_and_force() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);
    let core = gv("", "v1");
    assert_eq!(r.group_resources(&core, false).await.unwrap().resources.len(), 4);
    r.group_resources(&core, false).await.unwrap();
    assert_eq!(exact(&t, "/api/v1"), 1);
    r.group_resources(&core, true).await.unwrap();
    assert_eq!(exact(&t, "/api/v1"), 2);
    assert_eq!(r.indexed_group_versions(), vec![core]);
}

#[tokio::test]
async fn added_group_versions_are_indexed() {
    let t = cluster();
    let r = SchemaResolver::new(t.clone(), vec![]);
    r.add_group_version(gv("cert-manager.io", "v1")).await.unwrap();
    let found = r.search_by_group("cert-manager.io");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, "Certificate");

    r.add_group_version(gv("core", "v1")).await.unwrap();
    let kinds: Vec<String> = r.search_by_group("core").into_iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec!["ConfigMap", "Namespace", "Pod"]);
}
