use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use kpt_core::{CancellationToken, ErrorKind};
use kpt_fetch::{Fetcher, GitCli, GitFetcher};
use kpt_pkg::Upstream;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=kpt", "-c", "user.email=kpt@example.com", "-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn commit_file(dir: &Path, rel: &str, content: &str, msg: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", msg]);
}

fn head(dir: &Path) -> String {
    let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(dir).output().unwrap();
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}

#[tokio::test]
async fn fetches_subdirectory_at_branch_tag_and_commit() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let upstream = tempfile::tempdir().unwrap();
    let dir = upstream.path();
    git(dir, &["init", "-q"]);
    commit_file(dir, "pkgs/app/Kptfile", "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\n", "one");
    commit_file(dir, "pkgs/app/cm.yaml", "a: 1\n", "two");
    let first = head(dir);
    git(dir, &["tag", "v1"]);
    commit_file(dir, "pkgs/app/cm.yaml", "a: 2\n", "three");

    let repo = format!("file://{}", dir.display());
    let fetcher = GitFetcher::new(Arc::new(GitCli::new("git")));
    let token = CancellationToken::new();

    let main = fetcher.fetch(&Upstream::git(&repo, "/pkgs/app", "main"), &token).await.unwrap();
    assert_eq!(main.files.get_str("cm.yaml"), Some("a: 2\n"));
    assert!(main.files.contains("Kptfile"));
    let lock = main.lock.git.clone().unwrap();
    assert_eq!(lock.git_ref, "main");
    assert_eq!(lock.commit, head(dir));

    let tagged = fetcher.fetch(&Upstream::git(&repo, "/pkgs/app", "v1"), &token).await.unwrap();
    assert_eq!(tagged.files.get_str("cm.yaml"), Some("a: 1\n"));
    assert_eq!(tagged.lock.git.as_ref().unwrap().commit, first);

    let default_branch = fetcher.fetch(&Upstream::git(&repo, "/pkgs/app", ""), &token).await.unwrap();
    assert_eq!(default_branch.lock.git.as_ref().unwrap().git_ref, "main");

    let locked = fetcher.fetch_locked(&tagged.lock, &token).await.unwrap();
    assert_eq!(locked.files, tagged.files);
}

#[tokio::test]
async fn missing_ref_and_directory_are_not_found() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let upstream = tempfile::tempdir().unwrap();
    let dir = upstream.path();
    git(dir, &["init", "-q"]);
    commit_file(dir, "pkg/cm.yaml", "a: 1\n", "one");
    let repo = format!("file://{}", dir.display());
    let fetcher = GitFetcher::new(Arc::new(GitCli::new("git")));
    let token = CancellationToken::new();

    let err = fetcher.fetch(&Upstream::git(&repo, "/pkg", "nope"), &token).await.unwrap_err();
    assert!(err.is(ErrorKind::NotFound), "{}", err);
    let err = fetcher.fetch(&Upstream::git(&repo, "/other", "main"), &token).await.unwrap_err();
    assert!(err.is(ErrorKind::NotFound), "{}", err);
}
