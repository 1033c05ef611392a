#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use reflex_core::{object, LabelQuery, ObjectQuery, ResourceObject, TypeKey};
use reflex_store::ResourceCache;
use serde_json::{json, Value};

fn pods() -> ResourceCache { ResourceCache::new(TypeKey::new("", "v1", "Pod")) }
fn deployments() -> ResourceCache { ResourceCache::new(TypeKey::new("apps", "v1", "Deployment")) }

/// A list item: no apiVersion/kind.
fn item(uid: &str, ns: &str, name: &str) -> Value {
    json!({"metadata": {"uid": uid, "namespace": ns, "name": name}})
}

fn pod(uid: &str, ns: &str, name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"uid": uid, "namespace": ns, "name": name}})
}

fn labelled(uid: &str, ns: &str, labels: Value, annotations: Value) -> Value {
    json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"uid": uid, "namespace": ns, "name": format!("p-{uid}"), "labels": labels, "annotations": annotations}
    })
}

fn deploy(uid: &str, replicas: Value) -> Value {
    json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"uid": uid, "namespace": "default", "name": format!("d-{uid}")},
        "spec": {"replicas": replicas}
    })
}

fn uids(objs: &[Arc<ResourceObject>]) -> Vec<String> {
    let mut out: Vec<String> = objs.iter().filter_map(|o| object::uid(o).map(str::to_string)).collect();
    out.sort();
    out
}

#[test]
fn list_round_trip_backfills_type() {
    let mut c = pods();
    let n = c.add_objects(true, vec![item("a", "default", "a"), item("b", "kube-system", "b"), item("c", "default", "c")]);
    assert_eq!(n, 3);
    assert_eq!(c.len(), 3);
    let all = c.list();
    assert_eq!(uids(&all), vec!["a", "b", "c"]);
    for o in all.iter() {
        assert_eq!(o["apiVersion"], "v1");
        assert_eq!(o["kind"], "Pod");
    }
    // ordered by namespace then name
    let names: Vec<&str> = all.iter().filter_map(|o| object::name(o)).collect();
    assert_eq!(names, vec!["a", "c", "b"]);
}

#[test]
fn namespace_filter() {
    let mut c = pods();
    c.add_objects(true, vec![item("a", "default", "web"), item("b", "kube-system", "dns")]);
    let hits = c.search_objects(&ObjectQuery::default().namespace("default")).unwrap();
    assert_eq!(uids(&hits), vec!["a"]);
    assert!(c.search_objects(&ObjectQuery::default().namespace("nope")).unwrap().is_empty());
}

#[test]
fn uid_and_name_lookups() {
    let mut c = pods();
    c.add_objects(false, vec![pod("a", "default", "web"), pod("b", "prod", "web"), pod("c", "prod", "db")]);

    // uid wins over every other parameter
    let q = ObjectQuery::default().uid("a").namespace("prod").field("spec.x", json!(1));
    assert_eq!(uids(&c.search_objects(&q).unwrap()), vec!["a"]);
    assert!(c.search_objects(&ObjectQuery::default().uid("zzz")).unwrap().is_empty());

    let q = ObjectQuery::default().name("web").namespace("prod");
    assert_eq!(uids(&c.search_objects(&q).unwrap()), vec!["b"]);
    assert_eq!(uids(&c.search_objects(&ObjectQuery::default().name("web")).unwrap()), vec!["a", "b"]);
    assert!(c.search_objects(&ObjectQuery::default().name("web").namespace("other")).unwrap().is_empty());

    assert_eq!(c.search_objects(&ObjectQuery::default()).unwrap().len(), 3);
}

#[test]
fn uid_and_name_stay_unique() {
    let mut c = pods();
    let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
    let d = deleted.clone();
    c.on_deleted(move |o| d.lock().push(object::uid(o).unwrap_or("").to_string()));

    c.add_objects(false, vec![pod("a", "default", "web")]);
    // same uid again replaces
    c.add_objects(false, vec![pod("a", "default", "web")]);
    assert_eq!(c.len(), 1);
    assert!(deleted.lock().is_empty());

    // a new uid taking over default/web evicts the stale one
    c.add_objects(false, vec![pod("a2", "default", "web")]);
    assert_eq!(uids(&c.list()), vec!["a2"]);
    assert_eq!(*deleted.lock(), vec!["a".to_string()]);
    assert_eq!(c.search_objects(&ObjectQuery::default().name("web")).unwrap().len(), 1);
    assert!(c.get("a").is_none());
}

#[test]
fn lazy_field_index_on_replicas() {
    let mut c = deployments();
    c.add_objects(false, vec![deploy("d1", json!(3)), deploy("d2", json!(1)), deploy("d3", json!(3)), deploy("d4", json!("3"))]);
    assert!(c.field_indices().is_empty());

    let hits = c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(3))).unwrap();
    assert_eq!(uids(&hits), vec!["d1", "d3"]);
    assert_eq!(c.field_indices(), vec!["spec.replicas"]);

    // canonical text equality: the string "3" is a different value
    let hits = c.search_objects(&ObjectQuery::default().field("spec.replicas", json!("3"))).unwrap();
    assert_eq!(uids(&hits), vec!["d4"]);
    assert!(c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(3.0))).unwrap().is_empty());
}

#[test]
fn field_indices_follow_mutations() {
    let mut c = deployments();
    c.add_field_index("spec.replicas").unwrap();
    c.add_objects(false, vec![deploy("d1", json!(3)), deploy("d2", json!(1))]);
    c.modify_object(deploy("d2", json!(3)));
    c.add_objects(false, vec![deploy("d3", json!(2))]);
    c.delete_object(&deploy("d1", json!(3)));
    c.add_objects(false, vec![json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"uid": "d5", "name": "bare"}})]);

    for value in [json!(1), json!(2), json!(3)] {
        let expected: Vec<String> = uids(
            &c.list().into_iter().filter(|o| o["spec"]["replicas"].to_string() == value.to_string()).collect::<Vec<_>>(),
        );
        let got = uids(&c.search_objects(&ObjectQuery::default().field("spec.replicas", value.clone())).unwrap());
        assert_eq!(got, expected, "replicas == {value}");
    }
    let got = c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(3)).namespace("default")).unwrap();
    assert_eq!(uids(&got), vec!["d2"]);

    // rebuilding an existing index is harmless
    c.add_field_index("spec.replicas").unwrap();
    assert_eq!(uids(&c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(2))).unwrap()), vec!["d3"]);
}

#[test]
fn invalid_field_path_is_an_error() {
    let mut c = deployments();
    assert!(c.add_field_index("spec..replicas").is_err());
    assert!(c.search_objects(&ObjectQuery::default().field("spec[", json!(1))).is_err());
}

#[test]
fn empty_selectors_list_everything() {
    let mut c = pods();
    c.add_objects(false, vec![
        labelled("a", "default", json!({"app": "web"}), json!({})),
        labelled("b", "prod", json!({}), json!({"team": "x"})),
        pod("c", "prod", "plain"),
    ]);
    assert_eq!(uids(&c.search_by_label_selector(&LabelQuery::default())), uids(&c.list()));
}

#[test]
fn label_and_annotation_selectors() {
    let mut c = pods();
    c.add_objects(false, vec![
        labelled("a", "default", json!({"app": "web", "tier": "fe"}), json!({"team": "x"})),
        labelled("b", "prod", json!({"app": "web"}), json!({"team": "y"})),
        labelled("c", "prod", json!({"app": "db"}), json!({"team": "x"})),
    ]);
    assert_eq!(uids(&c.search_by_label_selector(&LabelQuery::default().label("app", "web"))), vec!["a", "b"]);
    assert_eq!(
        uids(&c.search_by_label_selector(&LabelQuery::default().label("app", "web").annotation("team", "x"))),
        vec!["a"]
    );
    assert_eq!(uids(&c.search_by_label_selector(&LabelQuery::default().annotation("team", "x").namespace("prod"))), vec!["c"]);
    assert!(c.search_by_label_selector(&LabelQuery::default().label("missing", "web")).is_empty());
    assert!(c.search_by_label_selector(&LabelQuery::default().namespace("nope")).is_empty());
}

#[test]
fn unknown_uids_are_ignored() {
    let mut c = pods();
    let events = Arc::new(Mutex::new(0usize));
    let (m, d) = (events.clone(), events.clone());
    c.on_modified(move |_, _| *m.lock() += 1);
    c.on_deleted(move |_| *d.lock() += 1);
    c.add_objects(false, vec![pod("a", "default", "web")]);

    assert!(!c.modify_object(pod("x", "default", "other")));
    assert!(!c.delete_object(&pod("x", "default", "other")));
    assert_eq!(c.len(), 1);
    assert_eq!(*events.lock(), 0);
}

#[test]
fn hooks_fire_in_order_after_mutation() {
    let mut c = pods();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let l = log.clone();
    c.on_added(move |o| l.lock().push(format!("added1:{}", object::uid(o).unwrap_or(""))));
    let l = log.clone();
    c.on_added(move |o| l.lock().push(format!("added2:{}", object::uid(o).unwrap_or(""))));
    let l = log.clone();
    c.on_modified(move |old, new| {
        l.lock().push(format!("modified:{}->{}", old["spec"]["v"], new["spec"]["v"]));
    });
    let l = log.clone();
    c.on_deleted(move |o| l.lock().push(format!("deleted:{}", o["spec"]["v"])));

    let mut a = pod("a", "default", "web");
    a["spec"] = json!({"v": 1});
    c.add_objects(false, vec![a.clone()]);
    a["spec"] = json!({"v": 2});
    assert!(c.modify_object(a));
    // the stored copy is reported, not the tombstone passed in
    assert!(c.delete_object(&pod("a", "default", "web")));

    assert_eq!(*log.lock(), vec!["added1:a", "added2:a", "modified:1->2", "deleted:2"]);
}

#[test]
fn invalid_objects_are_skipped() {
    let mut c = pods();
    let n = c.add_objects(false, vec![
        json!({"apiVersion": "v1", "kind": "Service", "metadata": {"uid": "s", "name": "svc"}}),
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "no-uid"}}),
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"uid": "no-name"}}),
        pod("ok", "default", "ok"),
    ]);
    assert_eq!(n, 1);
    assert_eq!(uids(&c.list()), vec!["ok"]);
    // list batches only fill in missing type fields
    assert_eq!(c.add_objects(true, vec![json!({"apiVersion": "apps/v1", "metadata": {"uid": "x", "name": "x"}})]), 0);
}

#[test]
fn clear_keeps_hooks_and_index_definitions() {
    let mut c = deployments();
    let added = Arc::new(Mutex::new(0usize));
    let a = added.clone();
    c.on_added(move |_| *a.lock() += 1);
    c.add_objects(false, vec![deploy("d1", json!(3))]);
    c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(3))).unwrap();

    c.clear();
    assert!(c.is_empty());
    assert!(c.list().is_empty());
    assert!(c.search_objects(&ObjectQuery::default().namespace("default")).unwrap().is_empty());
    assert_eq!(c.field_indices(), vec!["spec.replicas"]);

    c.add_objects(false, vec![deploy("d2", json!(3))]);
    assert_eq!(*added.lock(), 2);
    assert_eq!(uids(&c.search_objects(&ObjectQuery::default().field("spec.replicas", json!(3))).unwrap()), vec!["d2"]);
}
