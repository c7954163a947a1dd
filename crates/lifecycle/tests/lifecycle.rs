use std::sync::Arc;

use kpt_core::{generate_id, CancellationToken, ErrorKind};
use kpt_fetch::MemoryFetcher;
use kpt_lifecycle::{destroy, init, init_inventory, GetOptions, InitOptions, InventoryOptions, Lifecycle, UpdateOptions};
use kpt_pkg::{FileSet, Kptfile, UpdateStrategy, Upstream};

const REPO: &str = "https://example.com/blueprints.git";

fn kptfile(name: &str) -> String {
    format!("apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: {}\n", name)
}

fn deploy(replicas: u32) -> String {
    format!("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: {}\n", replicas)
}

fn upstream_pkg(replicas: u32, cm: &str) -> FileSet {
    let mut f = FileSet::new();
    f.insert("Kptfile", kptfile("app"));
    f.insert("deploy.yaml", deploy(replicas));
    f.insert("cm.yaml", format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  v: \"{}\"\n", cm));
    f
}

fn read(dir: &std::path::Path, rel: &str) -> String {
    std::fs::read_to_string(dir.join(rel)).unwrap()
}

fn setup() -> (Arc<MemoryFetcher>, Lifecycle, CancellationToken) {
    let fetcher = Arc::new(MemoryFetcher::new());
    let lc = Lifecycle::new(fetcher.clone());
    (fetcher, lc, CancellationToken::new())
}

#[tokio::test]
async fn get_writes_package_and_upstream_lock() {
    let (fetcher, lc, token) = setup();
    let commit = fetcher.publish_git(REPO, "/app", "v1", upstream_pkg(3, "a"));
    let ws = tempfile::tempdir().unwrap();
    let dest = ws.path().join("my-app");
    let report = lc
        .get(GetOptions { upstream: Upstream::git(REPO, "/app", "v1"), destination: dest.clone(), strategy: None }, &token)
        .await
        .unwrap();
    assert_eq!(report.lock.git.as_ref().unwrap().commit, commit);

    let kf = Kptfile::from_yaml(&read(&dest, "Kptfile")).unwrap();
    assert_eq!(kf.metadata.name, "my-app");
    assert_eq!(kf.upstream.as_ref().unwrap().git.as_ref().unwrap().git_ref, "v1");
    assert_eq!(kf.strategy(), UpdateStrategy::ResourceMerge);
    assert_eq!(kf.upstream_lock.unwrap().git.unwrap().commit, commit);
    assert_eq!(read(&dest, "deploy.yaml"), deploy(3));
}

#[tokio::test]
async fn get_refuses_non_empty_destination() {
    let (fetcher, lc, token) = setup();
    fetcher.publish_git(REPO, "/app", "v1", upstream_pkg(3, "a"));
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("keep.txt"), "x").unwrap();
    let err = lc
        .get(GetOptions { upstream: Upstream::git(REPO, "/app", "v1"), destination: ws.path().to_path_buf(), strategy: None }, &token)
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::AlreadyExists));
    assert_eq!(read(ws.path(), "keep.txt"), "x");
}

#[tokio::test]
async fn get_follows_nested_upstreams() {
    let (fetcher, lc, token) = setup();
    let mut db = FileSet::new();
    db.insert("Kptfile", kptfile("db"));
    db.insert("db.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: db\n");
    fetcher.publish_git(REPO, "/db", "v2", db);

    let mut app = upstream_pkg(3, "a");
    app.insert(
        "backend/Kptfile",
        format!("{}upstream:\n  type: git\n  git:\n    repo: {}\n    directory: /db\n    ref: v2\n", kptfile("backend"), REPO),
    );
    fetcher.publish_git(REPO, "/app", "v1", app);

    let ws = tempfile::tempdir().unwrap();
    let dest = ws.path().join("app");
    let report = lc
        .get(GetOptions { upstream: Upstream::git(REPO, "/app", "v1"), destination: dest.clone(), strategy: None }, &token)
        .await
        .unwrap();
    assert_eq!(report.nested, vec!["backend".to_string()]);
    assert!(dest.join("backend/db.yaml").is_file());
    let sub = Kptfile::from_yaml(&read(&dest, "backend/Kptfile")).unwrap();
    assert_eq!(sub.metadata.name, "backend");
    assert!(sub.upstream_lock.is_some());
}

#[tokio::test]
async fn update_merges_with_upstream_winning_conflicts() {
    let (fetcher, lc, token) = setup();
    fetcher.publish_git(REPO, "/app", "main", upstream_pkg(3, "a"));
    let ws = tempfile::tempdir().unwrap();
    let dest = ws.path().join("app");
    lc.get(GetOptions { upstream: Upstream::git(REPO, "/app", "main"), destination: dest.clone(), strategy: None }, &token)
        .await
        .unwrap();

    std::fs::write(dest.join("deploy.yaml"), deploy(11)).unwrap();
    std::fs::write(dest.join("notes.txt"), "mine\n").unwrap();
    let next = fetcher.publish_git(REPO, "/app", "main", upstream_pkg(7, "b"));

    let report = lc.update(UpdateOptions { package: dest.clone(), ..Default::default() }, &token).await.unwrap();
    assert_eq!(report.lock.git.as_ref().unwrap().commit, next);
    assert_eq!(read(&dest, "deploy.yaml"), deploy(7));
    assert!(read(&dest, "cm.yaml").contains("v: \"b\""));
    assert_eq!(read(&dest, "notes.txt"), "mine\n");
    let kf = Kptfile::from_yaml(&read(&dest, "Kptfile")).unwrap();
    assert_eq!(kf.metadata.name, "app");
    assert_eq!(kf.upstream_lock.unwrap().git.unwrap().commit, next);
}

#[tokio::test]
async fn fast_forward_refusal_leaves_directory_untouched() {
    let (fetcher, lc, token) = setup();
    fetcher.publish_git(REPO, "/app", "main", upstream_pkg(3, "a"));
    let ws = tempfile::tempdir().unwrap();
    let dest = ws.path().join("app");
    lc.get(
        GetOptions {
            upstream: Upstream::git(REPO, "/app", "main"),
            destination: dest.clone(),
            strategy: Some(UpdateStrategy::FastForward),
        },
        &token,
    )
    .await
    .unwrap();
    let edited = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  v: \"mine\"\n";
    std::fs::write(dest.join("cm.yaml"), edited).unwrap();
    let before = FileSet::from_dir(&dest).unwrap();
    fetcher.publish_git(REPO, "/app", "main", upstream_pkg(4, "a"));

    let err = lc.update(UpdateOptions { package: dest.clone(), ..Default::default() }, &token).await.unwrap_err();
    assert!(err.is(ErrorKind::ConflictingEdits));
    assert_eq!(err.conflicts()[0].file, "cm.yaml");
    assert_eq!(FileSet::from_dir(&dest).unwrap(), before);
}

#[tokio::test]
async fn update_moves_to_a_new_ref() {
    let (fetcher, lc, token) = setup();
    fetcher.publish_git(REPO, "/app", "v1", upstream_pkg(3, "a"));
    fetcher.publish_git(REPO, "/app", "v2", upstream_pkg(5, "a"));
    let ws = tempfile::tempdir().unwrap();
    let dest = ws.path().join("app");
    lc.get(GetOptions { upstream: Upstream::git(REPO, "/app", "v1"), destination: dest.clone(), strategy: None }, &token)
        .await
        .unwrap();
    lc.update(UpdateOptions { package: dest.clone(), git_ref: Some("v2".to_string()), strategy: None }, &token)
        .await
        .unwrap();
    assert_eq!(read(&dest, "deploy.yaml"), deploy(5));
    let kf = Kptfile::from_yaml(&read(&dest, "Kptfile")).unwrap();
    assert_eq!(kf.upstream.unwrap().git.unwrap().git_ref, "v2");
}

#[test]
fn init_and_inventory() {
    let ws = tempfile::tempdir().unwrap();
    let dir = ws.path().join("wordpress");
    let kf = init(&dir, &InitOptions { description: Some("blog".to_string()), ..Default::default() }).unwrap();
    assert_eq!(kf.metadata.name, "wordpress");
    assert!(init(&dir, &InitOptions::default()).unwrap_err().is(ErrorKind::AlreadyExists));

    let inv = init_inventory(
        &dir,
        &InventoryOptions { namespace: Some("test-namespace".to_string()), name: Some("inventory-obj-name".to_string()), ..Default::default() },
    )
    .unwrap();
    assert_eq!(inv.inventory_id.as_deref(), Some("b71156e872dad0b8efe1ce0303da20ef583453d6"));

    let again = InventoryOptions { namespace: Some("other".to_string()), name: Some("inv".to_string()), ..Default::default() };
    assert!(init_inventory(&dir, &again).unwrap_err().is(ErrorKind::AlreadyExists));
    let forced = init_inventory(&dir, &InventoryOptions { force: true, ..again }).unwrap();
    assert_eq!(forced.inventory_id, Some(generate_id("other", "inv")));

    let kf = Kptfile::from_yaml(&std::fs::read_to_string(dir.join("Kptfile")).unwrap()).unwrap();
    assert_eq!(kf.info.unwrap().description.as_deref(), Some("blog"));
    assert_eq!(kf.inventory.unwrap().namespace.as_deref(), Some("other"));
}

#[test]
fn destroy_requires_a_package() {
    let ws = tempfile::tempdir().unwrap();
    let dir = ws.path().join("pkg");
    std::fs::create_dir_all(&dir).unwrap();
    assert!(destroy(&dir).unwrap_err().is(ErrorKind::NotFound));
    init(&dir, &InitOptions::default()).unwrap();
    destroy(&dir).unwrap();
    assert!(!dir.exists());
}
