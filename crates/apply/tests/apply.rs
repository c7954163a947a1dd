use std::path::Path;
use std::sync::Arc;

use kpt_apply::inventory::OWNING_INVENTORY_ANNOTATION;
use kpt_apply::{ActionKind, Applier, ApplyOptions, InventoryPolicy, MemoryCluster};
use kpt_core::{generate_id, CancellationToken, ErrorKind, ResId};
use serde_json::json;

const KPTFILE: &str = "apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: app
inventory:
  namespace: prod
  name: app-inventory
";

fn write(dir: &Path, rel: &str, body: &str) {
    let p = dir.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

fn package() -> tempfile::TempDir {
    let ws = tempfile::tempdir().unwrap();
    write(ws.path(), "Kptfile", KPTFILE);
    write(ws.path(), "ns.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: prod\n");
    write(
        ws.path(),
        "deploy.yaml",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n",
    );
    write(
        ws.path(),
        "cm.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: prod\ndata:\n  mode: fast\n",
    );
    write(
        ws.path(),
        "local.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: fn-config\n  annotations:\n    config.kubernetes.io/local-config: \"true\"\n",
    );
    ws
}

fn id(group: &str, kind: &str, ns: Option<&str>, name: &str) -> ResId {
    ResId::new(group, kind, ns, name)
}

fn inventory_id() -> ResId {
    id("kpt.dev", "ResourceGroup", Some("prod"), "app-inventory")
}

fn setup() -> (Arc<MemoryCluster>, Applier, CancellationToken) {
    let cluster = Arc::new(MemoryCluster::new());
    (cluster.clone(), Applier::new(cluster), CancellationToken::new())
}

#[tokio::test]
async fn apply_records_inventory_and_defaults_namespace() {
    let (cluster, applier, token) = setup();
    let pkg = package();
    let report = applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();
    assert_eq!(report.inventory_id, generate_id("prod", "app-inventory"));
    assert_eq!(report.count(ActionKind::Created), 3);
    assert_eq!(report.actions[0].id.kind, "Namespace");

    let web = cluster.object(&id("apps", "Deployment", Some("prod"), "web")).unwrap();
    assert_eq!(web["metadata"]["annotations"][OWNING_INVENTORY_ANNOTATION], report.inventory_id.as_str());
    assert!(cluster.object(&id("", "ConfigMap", Some("prod"), "fn-config")).is_none());

    let inv = cluster.object(&inventory_id()).unwrap();
    assert_eq!(inv["spec"]["resources"].as_array().unwrap().len(), 3);

    let again = applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();
    assert_eq!(again.count(ActionKind::Unchanged), 3);
}

#[tokio::test]
async fn removed_objects_are_pruned_unless_kept() {
    let (cluster, applier, token) = setup();
    let pkg = package();
    write(
        pkg.path(),
        "keep.yaml",
        "apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n  annotations:\n    cli-utils.sigs.k8s.io/on-remove: keep\n",
    );
    applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();

    std::fs::remove_file(pkg.path().join("cm.yaml")).unwrap();
    std::fs::remove_file(pkg.path().join("keep.yaml")).unwrap();
    let report = applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();
    assert_eq!(report.count(ActionKind::Pruned), 1);
    assert_eq!(report.count(ActionKind::Skipped), 1);
    assert!(cluster.object(&id("", "ConfigMap", Some("prod"), "settings")).is_none());
    assert!(cluster.object(&id("", "Secret", Some("prod"), "creds")).is_some());

    let inv = cluster.object(&inventory_id()).unwrap();
    let kinds: Vec<&str> = inv["spec"]["resources"].as_array().unwrap().iter().map(|r| r["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds.len(), 2);
    assert!(!kinds.contains(&"Secret"));
}

#[tokio::test]
async fn strict_policy_refuses_foreign_objects_before_writing() {
    let (cluster, applier, token) = setup();
    cluster
        .insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "prod", "annotations": {OWNING_INVENTORY_ANNOTATION: "someone-else"}},
        }))
        .unwrap();
    let pkg = package();
    let err = applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap_err();
    assert!(err.is(ErrorKind::AlreadyExists), "{}", err);
    assert_eq!(cluster.applied(), 0);

    let adopt = ApplyOptions { policy: InventoryPolicy::Adopt, dry_run: false };
    let report = applier.apply(pkg.path(), adopt, &token).await.unwrap();
    assert_eq!(report.count(ActionKind::Configured), 1);
    let cm = cluster.object(&id("", "ConfigMap", Some("prod"), "settings")).unwrap();
    assert_eq!(cm["metadata"]["annotations"][OWNING_INVENTORY_ANNOTATION], report.inventory_id.as_str());
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let (cluster, applier, token) = setup();
    cluster
        .insert(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {"replicas": 1},
        }))
        .unwrap();
    let pkg = package();
    let report = applier.apply(pkg.path(), ApplyOptions { dry_run: true, ..Default::default() }, &token).await.unwrap();
    assert!(report.dry_run);
    let web = report.actions.iter().find(|a| a.id.kind == "Deployment").unwrap();
    assert_eq!(web.kind, ActionKind::Configured);
    // replicas changed, owning annotation added
    assert_eq!(web.summary.updates, 1);
    assert_eq!(web.summary.adds, 1);
    assert_eq!(cluster.applied(), 0);
    assert!(cluster.object(&inventory_id()).is_none());
}

#[tokio::test]
async fn destroy_deletes_members_then_inventory() {
    let (cluster, applier, token) = setup();
    let pkg = package();
    applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();
    let report = applier.destroy(pkg.path(), &token).await.unwrap();
    assert_eq!(report.count(ActionKind::Deleted), 3);
    assert_eq!(report.actions.last().unwrap().id.kind, "Namespace");
    assert!(cluster.ids().is_empty());

    let nothing = applier.destroy(pkg.path(), &token).await.unwrap();
    assert!(nothing.actions.is_empty());
}

#[tokio::test]
async fn apply_requires_an_inventory() {
    let (_, applier, token) = setup();
    let ws = tempfile::tempdir().unwrap();
    write(ws.path(), "Kptfile", "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: bare\n");
    let err = applier.apply(ws.path(), ApplyOptions::default(), &token).await.unwrap_err();
    assert!(err.is(ErrorKind::MissingParam));
}

#[tokio::test]
async fn failed_apply_keeps_previous_members_in_inventory() {
    let (cluster, applier, token) = setup();
    let pkg = package();
    applier.apply(pkg.path(), ApplyOptions::default(), &token).await.unwrap();
    std::fs::remove_file(pkg.path().join("cm.yaml")).unwrap();
    write(pkg.path(), "svc.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n");
    cluster.reject_kind("Service");
    assert!(applier.apply(pkg.path(), ApplyOptions::default(), &token).await.is_err());

    let inv = cluster.object(&inventory_id()).unwrap();
    let names: Vec<&str> = inv["spec"]["resources"].as_array().unwrap().iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"settings"));
    assert!(cluster.object(&id("", "ConfigMap", Some("prod"), "settings")).is_some());
}
