use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use kpt_core::{CancellationToken, ErrorKind};
use kpt_fetch::GitCli;
use kpt_pkg::FileSet;
use kpt_repository::{GitRepository, Lifecycle, PackageRevision, PackageRevisionKey, Repository, RepositoryConfig, Task};

fn git_available() -> bool {
    Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
}

fn bare_remote(dir: &Path) -> String {
    let status = Command::new("git").args(["init", "-q", "--bare"]).current_dir(dir).status().unwrap();
    assert!(status.success());
    format!("file://{}", dir.display())
}

fn remote_refs(dir: &Path) -> Vec<String> {
    let out = Command::new("git").args(["for-each-ref", "--format=%(refname)"]).current_dir(dir).output().unwrap();
    String::from_utf8(out.stdout).unwrap().lines().map(str::to_string).collect()
}

fn package(gate: bool) -> FileSet {
    let mut files = FileSet::new();
    let info = if gate { "info:\n  readinessGates:\n    - conditionType: approved\n" } else { "" };
    files.insert("Kptfile", format!("apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\n{}", info));
    files.insert("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\ndata:\n  a: \"1\"\n");
    files
}

fn key(ws: &str) -> PackageRevisionKey {
    PackageRevisionKey::new("blueprints", "app", ws)
}

#[tokio::test]
async fn drafts_become_tagged_revisions() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let remote_dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(remote_dir.path());
    let config = RepositoryConfig::git("blueprints", &remote, "main", "pkgs");
    let repo = GitRepository::new(config, Arc::new(GitCli::new("git"))).unwrap();
    let cancel = CancellationToken::new();

    let init = Task::Init { description: Some("app".into()), keywords: Vec::new(), site: None };
    let created = repo.create(&PackageRevision::draft(key("ws1"), vec![init.clone()]), &package(true), &cancel).await.unwrap();
    assert_eq!(created.readiness_gates, vec!["approved".to_string()]);
    assert!(remote_refs(remote_dir.path()).contains(&"refs/heads/drafts/app/ws1".to_string()));

    let listed = repo.list(&cancel).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].tasks, vec![init]);
    assert_eq!(listed[0].readiness_gates, vec!["approved".to_string()]);
    assert_eq!(repo.resources(&key("ws1"), &cancel).await.unwrap(), package(true));

    repo.update_lifecycle(&key("ws1"), Lifecycle::Proposed, &cancel).await.unwrap();
    let published = repo.update_lifecycle(&key("ws1"), Lifecycle::Published, &cancel).await.unwrap();
    assert_eq!(published.revision, Some(1));
    let refs = remote_refs(remote_dir.path());
    assert!(refs.contains(&"refs/tags/app/v1".to_string()));
    assert!(!refs.iter().any(|r| r.starts_with("refs/heads/proposals/")));

    let listed = repo.list(&cancel).await.unwrap();
    assert_eq!(listed[0].key.workspace, "ws1");
    assert_eq!(listed[0].lifecycle, Lifecycle::Published);

    let err = repo.update(&listed[0], &package(false), &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::LifecycleForbidden));

    repo.update_lifecycle(&key("ws1"), Lifecycle::DeletionProposed, &cancel).await.unwrap();
    assert_eq!(repo.list(&cancel).await.unwrap()[0].lifecycle, Lifecycle::DeletionProposed);
    repo.delete(&key("ws1"), &cancel).await.unwrap();
    assert!(repo.list(&cancel).await.unwrap().is_empty());
    assert_eq!(remote_refs(remote_dir.path()), vec!["refs/kpt/released/app/v1".to_string()]);
}

#[tokio::test]
async fn second_publish_gets_the_next_number_and_drafts_can_be_edited() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let remote_dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(remote_dir.path());
    let repo = GitRepository::new(RepositoryConfig::git("blueprints", &remote, "main", ""), Arc::new(GitCli::new("git"))).unwrap();
    let cancel = CancellationToken::new();

    for ws in ["a", "b"] {
        repo.create(&PackageRevision::draft(key(ws), Vec::new()), &package(false), &cancel).await.unwrap();
    }
    let mut edited = package(false);
    edited.insert("extra.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n");
    let draft = PackageRevision::draft(key("b"), Vec::new());
    repo.update(&draft, &edited, &cancel).await.unwrap();
    assert!(repo.resources(&key("b"), &cancel).await.unwrap().contains("extra.yaml"));
    assert!(!repo.resources(&key("a"), &cancel).await.unwrap().contains("extra.yaml"));

    assert_eq!(repo.update_lifecycle(&key("a"), Lifecycle::Published, &cancel).await.unwrap().revision, Some(1));
    assert_eq!(repo.update_lifecycle(&key("b"), Lifecycle::Published, &cancel).await.unwrap().revision, Some(2));

    let err = repo.create(&PackageRevision::draft(key("a"), Vec::new()), &package(false), &cancel).await.unwrap_err();
    assert!(err.is(ErrorKind::AlreadyExists));
}

#[tokio::test]
async fn deleted_revision_numbers_are_not_reused() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let remote_dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(remote_dir.path());
    let repo = GitRepository::new(RepositoryConfig::git("blueprints", &remote, "main", ""), Arc::new(GitCli::new("git"))).unwrap();
    let cancel = CancellationToken::new();

    for ws in ["a", "b"] {
        repo.create(&PackageRevision::draft(key(ws), Vec::new()), &package(false), &cancel).await.unwrap();
        repo.update_lifecycle(&key(ws), Lifecycle::Published, &cancel).await.unwrap();
    }
    repo.update_lifecycle(&key("b"), Lifecycle::DeletionProposed, &cancel).await.unwrap();
    repo.delete(&key("b"), &cancel).await.unwrap();
    assert!(!remote_refs(remote_dir.path()).contains(&"refs/tags/app/v2".to_string()));

    repo.create(&PackageRevision::draft(key("c"), Vec::new()), &package(false), &cancel).await.unwrap();
    let published = repo.update_lifecycle(&key("c"), Lifecycle::Published, &cancel).await.unwrap();
    assert_eq!(published.revision, Some(3));
    let revisions: Vec<Option<u32>> = repo.list(&cancel).await.unwrap().iter().map(|r| r.revision).collect();
    assert!(revisions.contains(&Some(1)) && revisions.contains(&Some(3)) && !revisions.contains(&Some(2)));
}
