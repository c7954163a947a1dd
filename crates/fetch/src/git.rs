//! Git access through the `git` binary.
//!
//! Every call runs in a scratch repository with `GIT_TERMINAL_PROMPT=0`, so a
//! missing credential fails fast instead of blocking on a prompt. Failures
//! are classified from stderr into `NotFound`, `AuthError` and
//! `TransportError`.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, ErrorKind, Result};
use kpt_pkg::{FileSet, GitLock, Upstream, UpstreamLock};
use metrics::{counter, histogram};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::auth::{Credential, CredentialResolver, EnvCredentials};
use crate::retry::retry_transport;
use crate::{Fetched, Fetcher};

/// Refs advertised by a remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRefs {
    /// Branch `HEAD` points at, when the remote says.
    pub head: Option<String>,
    /// Full ref name to commit. Annotated tags resolve to the tagged commit.
    pub refs: BTreeMap<String, String>,
}

impl RemoteRefs {
    pub fn parse(out: &str) -> Self {
        let mut r = RemoteRefs::default();
        for line in out.lines() {
            if let Some(rest) = line.strip_prefix("ref: ") {
                if let Some((target, "HEAD")) = rest.split_once('\t') {
                    r.head = target.strip_prefix("refs/heads/").map(str::to_string);
                }
                continue;
            }
            let Some((sha, name)) = line.split_once('\t') else { continue };
            if name == "HEAD" {
                continue;
            }
            match name.strip_suffix("^{}") {
                Some(tag) => {
                    r.refs.insert(tag.to_string(), sha.to_string());
                }
                None => {
                    r.refs.entry(name.to_string()).or_insert_with(|| sha.to_string());
                }
            }
        }
        r
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().filter_map(|k| k.strip_prefix("refs/heads/"))
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().filter_map(|k| k.strip_prefix("refs/tags/"))
    }

    /// Commit for a branch, tag or full ref name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        [format!("refs/heads/{}", name), format!("refs/tags/{}", name), name.to_string()]
            .iter()
            .find_map(|k| self.refs.get(k))
            .map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

/// Looks like an abbreviated or full commit id.
pub fn is_commit_id(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn classify(stderr: &str) -> ErrorKind {
    let s = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| s.contains(n));
    if any(&["authentication failed", "could not read username", "could not read password", "permission denied", "returned error: 401", "returned error: 403"]) {
        ErrorKind::AuthError
    } else if any(&["couldn't find remote ref", "not found", "does not appear to be a git repository", "did not match any", "unknown revision", "not our ref", "not a valid object name", "no such remote ref"]) {
        ErrorKind::NotFound
    } else if any(&["could not resolve host", "connection", "timed out", "unable to access", "early eof", "the remote end hung up"]) {
        ErrorKind::TransportError
    } else {
        ErrorKind::Internal
    }
}

/// A remote address with credentials applied.
struct Remote {
    url: String,
    env: Vec<(String, String)>,
}

pub struct GitCli {
    bin: String,
    backoff: Duration,
    credentials: Arc<dyn CredentialResolver>,
}

impl GitCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into(), backoff: Duration::from_millis(500), credentials: Arc::new(EnvCredentials) }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.git_bin.clone()).with_backoff(settings.retry_backoff)
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    async fn remote(&self, repo: &str) -> Result<Remote> {
        let mut remote = Remote { url: repo.to_string(), env: Vec::new() };
        let (user, pass) = match self.credentials.resolve(repo).await? {
            None => return Ok(remote),
            Some(Credential::SshKey(key)) => {
                let cmd = format!("ssh -i {} -o IdentitiesOnly=yes", key.display());
                remote.env.push(("GIT_SSH_COMMAND".to_string(), cmd));
                return Ok(remote);
            }
            Some(Credential::Basic { username, password }) => (username, password),
            Some(Credential::Token(token)) => ("git".to_string(), token),
        };
        if let Ok(mut url) = url::Url::parse(repo) {
            if matches!(url.scheme(), "http" | "https") && url.set_username(&user).is_ok() && url.set_password(Some(&pass)).is_ok() {
                remote.url = url.to_string();
            }
        }
        Ok(remote)
    }

    async fn exec(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        env: &[(String, String)],
        input: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let op = format!("git {}", args.iter().find(|a| !a.starts_with('-') && !a.contains('=')).unwrap_or(&""));
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(d) = dir {
            cmd.current_dir(d);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::internal(format!("git binary {:?} not found", self.bin)).with_op(op.clone())
            } else {
                Error::from(e).with_op(op.clone())
            }
        })?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
        }
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::internal("cancelled").with_op(op)),
            out = child.wait_with_output() => out?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(%op, %stderr, "git failed");
            return Err(Error::new(classify(&stderr), stderr).with_op(op));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs a local git command in `dir`.
    pub async fn run(&self, dir: &Path, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        self.exec(Some(dir), args, &[], None, cancel).await
    }

    /// Runs a local git command in `dir` with `input` on stdin.
    pub async fn run_input(&self, dir: &Path, args: &[&str], input: &[u8], cancel: &CancellationToken) -> Result<String> {
        self.exec(Some(dir), args, &[], Some(input), cancel).await
    }

    /// Runs a command that talks to `repo`, whose address is the last argument.
    pub async fn run_remote(&self, dir: &Path, args: &[&str], repo: &str, cancel: &CancellationToken) -> Result<String> {
        let remote = self.remote(repo).await?;
        let mut full: Vec<&str> = args.to_vec();
        full.push(&remote.url);
        self.exec(Some(dir), &full, &remote.env, None, cancel)
            .await
            .map_err(|e| redact(e, &remote.url, repo))
    }

    /// Runs a command that talks to `repo`, with `refspecs` after the address.
    pub async fn run_remote_refs(
        &self,
        dir: &Path,
        args: &[&str],
        repo: &str,
        refspecs: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let remote = self.remote(repo).await?;
        let mut full: Vec<&str> = args.to_vec();
        full.push(&remote.url);
        full.extend_from_slice(refspecs);
        self.exec(Some(dir), &full, &remote.env, None, cancel)
            .await
            .map_err(|e| redact(e, &remote.url, repo))
    }

    pub async fn ls_remote(&self, repo: &str, cancel: &CancellationToken) -> Result<RemoteRefs> {
        let remote = self.remote(repo).await?;
        let out = self
            .exec(None, &["ls-remote", "--symref", &remote.url], &remote.env, None, cancel)
            .await
            .map_err(|e| redact(e, &remote.url, repo))?;
        Ok(RemoteRefs::parse(&out))
    }

    /// Checks out `rev` of `repo` into a scratch directory and returns it with
    /// the commit it resolved to.
    pub async fn checkout(&self, repo: &str, rev: &str, cancel: &CancellationToken) -> Result<(tempfile::TempDir, String)> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        self.run(dir, &["init", "-q"], cancel).await?;
        let target = match self.run_remote_refs(dir, &["fetch", "-q", "--depth", "1"], repo, &[rev], cancel).await {
            Ok(_) => "FETCH_HEAD".to_string(),
            Err(e) if is_commit_id(rev) && e.is(ErrorKind::NotFound) => {
                // Servers may refuse to serve an arbitrary commit; take every
                // ref and resolve it locally.
                self.run_remote_refs(
                    dir,
                    &["fetch", "-q"],
                    repo,
                    &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"],
                    cancel,
                )
                .await?;
                rev.to_string()
            }
            Err(e) => return Err(e),
        };
        self.run(dir, &["-c", "advice.detachedHead=false", "checkout", "-q", &target], cancel).await?;
        let commit = self.run(dir, &["rev-parse", "HEAD"], cancel).await?.trim().to_string();
        Ok((tmp, commit))
    }

    /// Files of `directory` at `rev`, with the resolved commit.
    pub async fn materialize(&self, repo: &str, rev: &str, directory: &str, cancel: &CancellationToken) -> Result<(FileSet, String)> {
        let (tmp, commit) = self.checkout(repo, rev, cancel).await?;
        let sub = directory.trim_matches('/');
        let root = if sub.is_empty() { tmp.path().to_path_buf() } else { tmp.path().join(sub) };
        if !root.is_dir() {
            return Err(Error::not_found(format!("directory {:?} not found in {} at {}", directory, repo, rev)).with_op("git.fetch"));
        }
        let files = FileSet::from_dir(&root)?;
        Ok((files, commit))
    }
}

fn redact(e: Error, url: &str, repo: &str) -> Error {
    if url == repo || !e.message().contains(url) {
        return e;
    }
    let msg = e.message().replace(url, repo);
    Error::new(e.kind(), msg).with_op(e.op().to_string())
}

pub struct GitFetcher {
    git: Arc<GitCli>,
}

impl GitFetcher {
    pub fn new(git: Arc<GitCli>) -> Self {
        Self { git }
    }

    async fn fetch_rev(&self, repo: &str, rev: &str, directory: &str, cancel: &CancellationToken) -> Result<(FileSet, String)> {
        retry_transport("git.fetch", self.git.backoff(), cancel, || self.git.materialize(repo, rev, directory, cancel)).await
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    fn validate(&self, upstream: &Upstream) -> Result<()> {
        let git = upstream.git.as_ref().ok_or_else(|| Error::missing_param("upstream.git is required").with_op("git.validate"))?;
        if git.repo.trim().is_empty() {
            return Err(Error::missing_param("upstream.git.repo is required").with_op("git.validate"));
        }
        if git.directory.split('/').any(|c| c == "..") {
            return Err(Error::invalid_param(format!("directory {:?} escapes the repository", git.directory)).with_op("git.validate"));
        }
        Ok(())
    }

    async fn fetch(&self, upstream: &Upstream, cancel: &CancellationToken) -> Result<Fetched> {
        self.validate(upstream)?;
        let t0 = Instant::now();
        let git = upstream.git.as_ref().ok_or_else(|| Error::missing_param("upstream.git is required"))?;
        let refs = retry_transport("git.ls_remote", self.git.backoff(), cancel, || self.git.ls_remote(&git.repo, cancel)).await?;
        let named = if git.git_ref.is_empty() {
            refs.head
                .clone()
                .ok_or_else(|| Error::not_found(format!("{} has no default branch", git.repo)).with_op("git.fetch"))?
        } else {
            git.git_ref.clone()
        };
        if !refs.has(&named) && !is_commit_id(&named) {
            return Err(Error::not_found(format!("ref {:?} not found in {}", named, git.repo)).with_op("git.fetch"));
        }
        let (files, commit) = self.fetch_rev(&git.repo, &named, &git.directory, cancel).await?;
        let lock = UpstreamLock::git(GitLock {
            repo: git.repo.clone(),
            directory: git.directory.clone(),
            git_ref: named.clone(),
            commit: commit.clone(),
        });
        histogram!("kpt_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_fetch_total", 1u64, "origin" => "git");
        info!(repo = %git.repo, dir = %git.directory, git_ref = %named, %commit, files = files.len(), took_ms = %t0.elapsed().as_millis(), "fetched git upstream");
        Ok(Fetched { files, lock })
    }

    async fn fetch_locked(&self, lock: &UpstreamLock, cancel: &CancellationToken) -> Result<Fetched> {
        let git = lock.git.as_ref().ok_or_else(|| Error::missing_param("upstreamLock.git is required").with_op("git.fetch"))?;
        if git.commit.is_empty() {
            return Err(Error::missing_param("upstreamLock.git.commit is required").with_op("git.fetch"));
        }
        let (files, commit) = self.fetch_rev(&git.repo, &git.commit, &git.directory, cancel).await?;
        if !commit.starts_with(&git.commit) {
            return Err(Error::internal(format!("fetched {} but the lock pins {}", commit, git.commit)).with_op("git.fetch"));
        }
        debug!(repo = %git.repo, %commit, "fetched locked git upstream");
        Ok(Fetched { files, lock: lock.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LS_REMOTE: &str = "ref: refs/heads/main\tHEAD\n\
        1111111111111111111111111111111111111111\tHEAD\n\
        1111111111111111111111111111111111111111\trefs/heads/main\n\
        2222222222222222222222222222222222222222\trefs/heads/feature/x\n\
        3333333333333333333333333333333333333333\trefs/tags/v1\n\
        4444444444444444444444444444444444444444\trefs/tags/v1^{}\n";

    #[test]
    fn parses_ls_remote_with_symref_and_peeled_tags() {
        let r = RemoteRefs::parse(LS_REMOTE);
        assert_eq!(r.head.as_deref(), Some("main"));
        assert_eq!(r.lookup("main"), Some("1111111111111111111111111111111111111111"));
        assert_eq!(r.lookup("v1"), Some("4444444444444444444444444444444444444444"));
        assert_eq!(r.lookup("feature/x"), Some("2222222222222222222222222222222222222222"));
        assert_eq!(r.branches().collect::<Vec<_>>(), vec!["feature/x", "main"]);
        assert!(!r.has("nope"));
    }

    #[test]
    fn classifies_stderr() {
        assert_eq!(classify("fatal: Authentication failed for 'https://x'"), ErrorKind::AuthError);
        assert_eq!(classify("fatal: couldn't find remote ref nope"), ErrorKind::NotFound);
        assert_eq!(classify("fatal: unable to access 'https://x/': Could not resolve host: x"), ErrorKind::TransportError);
        assert_eq!(classify("fatal: something odd"), ErrorKind::Internal);
    }

    #[test]
    fn commit_ids() {
        assert!(is_commit_id("abc1234"));
        assert!(!is_commit_id("abc12"));
        assert!(!is_commit_id("main"));
        assert!(!is_commit_id("v1.0.0"));
    }

    #[test]
    fn validate_rejects_escaping_dirs() {
        let f = GitFetcher::new(Arc::new(GitCli::new("git")));
        assert!(f.validate(&Upstream::git("https://x/r.git", "/pkg", "main")).is_ok());
        let err = f.validate(&Upstream::git("https://x/r.git", "../up", "main")).unwrap_err();
        assert!(err.is(ErrorKind::InvalidParam));
        assert!(f.validate(&Upstream::oci("x")).unwrap_err().is(ErrorKind::MissingParam));
    }
}
