use std::sync::Arc;
use std::time::Duration;

use kpt_cache::{Cache, CacheOptions, Opener};
use kpt_core::{CancellationToken, ErrorKind};
use kpt_engine::{CaDEngine, RevisionFilter};
use kpt_fetch::MemoryFetcher;
use kpt_fnruntime::{FnRuntime, ScriptedRunner};
use kpt_pkg::{kptfile_of, Condition, ConditionStatus, FileSet, Function, Kptfile, ReadinessGate, Status, Upstream};
use kpt_repository::{
    Lifecycle, MemoryRepository, PackageRevision, PackageRevisionKey, Repository, RepositoryConfig, Task, UpstreamSource,
};

const UPSTREAM: &str = "https://example.com/blueprints.git";

fn runner() -> ScriptedRunner {
    ScriptedRunner::new().with("example.com/fns/team:v1", |list| {
        for item in list.items.iter_mut().filter(|r| !r.is_kptfile()) {
            item.set_label("team", "payments");
        }
        Ok(())
    })
}

fn open_memory(config: RepositoryConfig) -> kpt_core::Result<Arc<dyn Repository>> {
    Ok(Arc::new(MemoryRepository::with_config(config)))
}

fn engine(fetcher: Arc<MemoryFetcher>) -> CaDEngine {
    let opener: Opener = Arc::new(open_memory);
    let cache = Arc::new(Cache::new(opener, CacheOptions::default()));
    CaDEngine::new(cache, fetcher, FnRuntime::new(Arc::new(runner()), Duration::from_secs(5)))
}

async fn registered(fetcher: Arc<MemoryFetcher>) -> CaDEngine {
    let e = engine(fetcher);
    e.register_repository(RepositoryConfig::git("deploy", "https://example.com/deploy.git", "main", ""))
        .await
        .unwrap();
    e
}

fn key(package: &str, ws: &str) -> PackageRevisionKey {
    PackageRevisionKey::new("deploy", package, ws)
}

fn base_package(name: &str) -> FileSet {
    let mut f = FileSet::new();
    f.insert("Kptfile", Kptfile::new(name).to_yaml().unwrap());
    f.insert("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  replicas: \"1\"\n");
    f
}

fn clone_from(upstream: Upstream) -> Task {
    Task::Clone { upstream: UpstreamSource { upstream: Some(upstream), upstream_ref: None } }
}

/// Rewrites the Kptfile so it carries one readiness gate `foo` with the
/// given condition status.
fn with_gate(files: &FileSet, status: ConditionStatus) -> FileSet {
    let mut kf = kptfile_of(files).unwrap();
    let mut info = kf.info.clone().unwrap_or_default();
    info.readiness_gates = vec![ReadinessGate { condition_type: "foo".into() }];
    kf.info = Some(info);
    kf.status = Some(Status { conditions: vec![Condition { condition_type: "foo".into(), status, ..Default::default() }] });
    let mut out = files.clone();
    out.insert("Kptfile", kf.to_yaml().unwrap());
    out
}

async fn move_to(e: &CaDEngine, k: &PackageRevisionKey, to: Lifecycle) -> PackageRevision {
    let cancel = CancellationToken::new();
    let mut rev = e.get_package_revision(k, &cancel).await.unwrap();
    rev.lifecycle = to;
    e.update_package_revision(&rev, &cancel).await.unwrap()
}

#[tokio::test]
async fn approval_waits_for_readiness_gates() {
    let e = registered(Arc::new(MemoryFetcher::new())).await;
    let cancel = CancellationToken::new();
    let k = key("app", "ws1");

    let created = e.create_package_revision(&PackageRevision::draft(k.clone(), Vec::new()), &cancel).await.unwrap();
    assert_eq!(created.lifecycle, Lifecycle::Draft);
    assert!(matches!(created.tasks.as_slice(), [Task::Init { .. }]));

    let files = e.get_package_resources(&k, &cancel).await.unwrap();
    let (rev, _) = e.update_package_resources(&k, &with_gate(&files, ConditionStatus::False), &cancel).await.unwrap();
    assert_eq!(rev.readiness_gates, vec!["foo".to_string()]);
    assert!(matches!(rev.tasks.last(), Some(Task::Patch { .. })));

    move_to(&e, &k, Lifecycle::Proposed).await;
    let err = e.approve_package_revision(&k, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden), "{}", err);

    // Content is frozen while proposed; go back to draft to flip the gate.
    let files = e.get_package_resources(&k, &cancel).await.unwrap();
    let err = e.update_package_resources(&k, &with_gate(&files, ConditionStatus::True), &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden));
    move_to(&e, &k, Lifecycle::Draft).await;
    e.update_package_resources(&k, &with_gate(&files, ConditionStatus::True), &cancel).await.unwrap();
    move_to(&e, &k, Lifecycle::Proposed).await;

    let published = e.approve_package_revision(&k, &cancel).await.unwrap();
    assert_eq!(published.lifecycle, Lifecycle::Published);
    assert_eq!(published.revision_name().as_deref(), Some("v1"));

    let mut back = published.clone();
    back.lifecycle = Lifecycle::Draft;
    let err = e.update_package_revision(&back, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden));

    move_to(&e, &k, Lifecycle::DeletionProposed).await;
    e.delete_package_revision(&k, &cancel).await.unwrap();
    let err = e.get_package_revision(&k, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::NotFound));
    e.close().await;
}

#[tokio::test]
async fn publishing_only_through_approval() {
    let e = registered(Arc::new(MemoryFetcher::new())).await;
    let k = key("app", "ws1");
    let cancel = CancellationToken::new();
    e.create_package_revision(&PackageRevision::draft(k.clone(), Vec::new()), &cancel).await.unwrap();
    move_to(&e, &k, Lifecycle::Proposed).await;

    let mut rev = e.get_package_revision(&k, &cancel).await.unwrap();
    rev.lifecycle = Lifecycle::Published;
    let err = e.update_package_revision(&rev, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden));

    let mut not_draft = PackageRevision::draft(key("other", "ws1"), Vec::new());
    not_draft.lifecycle = Lifecycle::Proposed;
    let err = e.create_package_revision(&not_draft, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden));
}

#[tokio::test]
async fn clone_update_and_replay() {
    let fetcher = Arc::new(MemoryFetcher::new());
    let first = fetcher.publish_git(UPSTREAM, "base", "v1", base_package("base"));
    let e = registered(fetcher.clone()).await;
    let cancel = CancellationToken::new();
    let k = key("app", "ws1");

    let rev = PackageRevision::draft(
        k.clone(),
        vec![clone_from(Upstream::git(UPSTREAM, "base", "v1")), Task::Eval { function: Function::image("example.com/fns/team:v1") }],
    );
    e.create_package_revision(&rev, &cancel).await.unwrap();
    let files = e.get_package_resources(&k, &cancel).await.unwrap();
    let kf = kptfile_of(&files).unwrap();
    assert_eq!(kf.metadata.name, "app");
    assert_eq!(kf.upstream_lock.as_ref().and_then(|l| l.git.as_ref()).map(|g| g.commit.clone()), Some(first));
    assert!(files.get_str("cm.yaml").unwrap().contains("team: payments"));

    // A local edit, then a new upstream version adding a file.
    let mut edited = files.clone();
    edited.insert("cm.yaml", files.get_str("cm.yaml").unwrap().replace("replicas: \"1\"", "replicas: \"3\""));
    e.update_package_resources(&k, &edited, &cancel).await.unwrap();

    let mut next = base_package("base");
    next.insert("svc.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n");
    let second = fetcher.publish_git(UPSTREAM, "base", "v2", next);

    let mut rev = e.get_package_revision(&k, &cancel).await.unwrap();
    rev.tasks.push(Task::Update { upstream: UpstreamSource { upstream: Some(Upstream::git(UPSTREAM, "base", "v2")), upstream_ref: None } });
    let updated = e.update_package_revision(&rev, &cancel).await.unwrap();
    assert_eq!(updated.tasks.len(), 4);

    let files = e.get_package_resources(&k, &cancel).await.unwrap();
    assert!(files.contains("svc.yaml"));
    assert!(files.get_str("cm.yaml").unwrap().contains("replicas: \"3\""));
    let kf = kptfile_of(&files).unwrap();
    assert_eq!(kf.upstream_lock.as_ref().and_then(|l| l.git.as_ref()).map(|g| g.commit.clone()), Some(second));

    // The task history alone rebuilds the same content.
    let config = e.list_repositories().remove(0);
    let replayed = e.executor().replay(&k, &config, &updated.tasks, &cancel).await.unwrap();
    assert_eq!(replayed, files);
}

#[tokio::test]
async fn clone_from_a_published_revision() {
    let e = registered(Arc::new(MemoryFetcher::new())).await;
    let cancel = CancellationToken::new();
    let source = key("blueprint", "ws1");
    e.create_package_revision(&PackageRevision::draft(source.clone(), Vec::new()), &cancel).await.unwrap();

    let from_ref = |ws: &str| {
        PackageRevision::draft(
            key("copy", ws),
            vec![Task::Clone { upstream: UpstreamSource { upstream: None, upstream_ref: Some(source.clone()) } }],
        )
    };
    let err = e.create_package_revision(&from_ref("ws1"), &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam), "drafts are not a source: {}", err);

    move_to(&e, &source, Lifecycle::Proposed).await;
    e.approve_package_revision(&source, &cancel).await.unwrap();
    e.create_package_revision(&from_ref("ws2"), &cancel).await.unwrap();
    let files = e.get_package_resources(&key("copy", "ws2"), &cancel).await.unwrap();
    assert_eq!(kptfile_of(&files).unwrap().metadata.name, "copy");

    let edit = PackageRevision::draft(key("blueprint", "ws2"), vec![Task::Edit { source_ref: source.clone() }]);
    e.create_package_revision(&edit, &cancel).await.unwrap();
    let listed = e
        .list_package_revisions(&RevisionFilter { package: Some("blueprint".into()), ..Default::default() }, &cancel)
        .await
        .unwrap();
    let names: Vec<_> = listed.iter().map(|r| r.key.workspace.as_str()).collect();
    assert_eq!(names, vec!["ws1", "ws2"]);
}

#[tokio::test]
async fn task_lists_are_checked() {
    let e = registered(Arc::new(MemoryFetcher::new())).await;
    let cancel = CancellationToken::new();

    let patch_first = PackageRevision::draft(key("app", "ws1"), vec![Task::Patch { patches: Vec::new() }]);
    let err = e.create_package_revision(&patch_first, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam));

    let k = key("app", "ws2");
    e.create_package_revision(&PackageRevision::draft(k.clone(), Vec::new()), &cancel).await.unwrap();

    // Nothing to update from: the draft was never cloned.
    let mut rev = e.get_package_revision(&k, &cancel).await.unwrap();
    rev.tasks.push(Task::Update { upstream: UpstreamSource { upstream: Some(Upstream::git(UPSTREAM, "base", "main")), upstream_ref: None } });
    let err = e.update_package_revision(&rev, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam));

    let mut rewritten = e.get_package_revision(&k, &cancel).await.unwrap();
    rewritten.tasks.clear();
    let err = e.update_package_revision(&rewritten, &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam));

    let err = e.create_package_revision(&PackageRevision::draft(k.clone(), Vec::new()), &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::AlreadyExists));
}

#[tokio::test]
async fn registered_repositories_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("repositories.yaml");

    let e = engine(Arc::new(MemoryFetcher::new())).with_repositories_file(&file);
    e.register_repository(RepositoryConfig::git("deploy", "https://example.com/deploy.git", "main", "")).await.unwrap();
    e.register_repository(RepositoryConfig::oci("fns", "registry.example.com/fns")).await.unwrap();

    let mut elsewhere = RepositoryConfig::git("other", "https://example.com/other.git", "main", "");
    elsewhere.metadata.namespace = "prod".into();
    let err = e.register_repository(elsewhere).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam));
    e.close().await;

    let restarted = engine(Arc::new(MemoryFetcher::new())).with_repositories_file(&file);
    assert_eq!(restarted.load_repositories().await.unwrap(), 2);
    let names: Vec<_> = restarted.list_repositories().iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["deploy", "fns"]);

    restarted.unregister_repository("fns").await.unwrap();
    let err = restarted.unregister_repository("fns").await.unwrap_err();
    assert!(err.is(ErrorKind::NotFound));
    restarted.close().await;
}
