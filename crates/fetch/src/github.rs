//! Parsing of `pkg get` source arguments.
//!
//! Two shapes are accepted:
//! - `<repo>.git[/<dir>][@<ref>]`, where `<repo>` may be https, ssh,
//!   `git@host:path` or a local path;
//! - `https://github.com/<owner>/<repo>[/tree/<ref>[/<dir>]]`, where a ref
//!   containing slashes is told apart from the directory by asking the
//!   remote which branches and tags exist.

use kpt_core::{CancellationToken, Error, Result};

use crate::git::GitCli;
use crate::retry::retry_transport;

/// A fully split git source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitArg {
    pub repo: String,
    /// Always starts with `/`; `/` alone is the repository root.
    pub directory: String,
    /// Empty for the remote's default branch.
    pub git_ref: String,
}

impl GitArg {
    /// Directory name a package lands in when no destination is given.
    pub fn default_destination(&self) -> String {
        let dir = self.directory.trim_matches('/');
        let name = if dir.is_empty() {
            self.repo.trim_end_matches('/').rsplit(['/', ':']).next().unwrap_or("")
        } else {
            dir.rsplit('/').next().unwrap_or(dir)
        };
        name.trim_end_matches(".git").to_string()
    }
}

/// Outcome of the syntactic parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedArg {
    Resolved(GitArg),
    /// GitHub tree URL whose `<ref>/<dir>` split needs the remote's refs.
    Ambiguous { repo: String, segments: Vec<String> },
}

fn normalize_dir(dir: &str) -> String {
    format!("/{}", dir.trim_matches('/'))
}

/// Position just past `.git` when it ends a path component.
fn git_suffix_end(arg: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = arg[from..].find(".git") {
        let end = from + i + 4;
        match arg[end..].chars().next() {
            None | Some('/') | Some('@') => return Some(end),
            _ => from = end,
        }
    }
    None
}

pub fn parse_git_arg(arg: &str) -> Result<ParsedArg> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(Error::missing_param("package source is required").with_op("pkg.get"));
    }
    if let Some(end) = git_suffix_end(arg) {
        let (repo, rest) = arg.split_at(end);
        let (dir, git_ref) = match rest.rsplit_once('@') {
            Some((d, r)) => (d, r),
            None => (rest, ""),
        };
        return Ok(ParsedArg::Resolved(GitArg {
            repo: repo.to_string(),
            directory: normalize_dir(dir),
            git_ref: git_ref.to_string(),
        }));
    }
    if let Some(path) = arg.strip_prefix("https://github.com/") {
        let segs: Vec<&str> = path.trim_end_matches('/').split('/').filter(|s| !s.is_empty()).collect();
        if segs.len() < 2 {
            return Err(Error::invalid_param(format!("{:?} does not name a GitHub repository", arg)).with_op("pkg.get"));
        }
        let repo = format!("https://github.com/{}/{}", segs[0], segs[1]);
        return match segs.get(2) {
            None => Ok(ParsedArg::Resolved(GitArg { repo, directory: "/".to_string(), git_ref: String::new() })),
            Some(&"tree") | Some(&"blob") if segs.len() > 3 => Ok(ParsedArg::Ambiguous {
                repo,
                segments: segs[3..].iter().map(|s| s.to_string()).collect(),
            }),
            Some(_) => Err(Error::invalid_param(format!("{:?}: expected /tree/<ref>[/<dir>] after the repository", arg)).with_op("pkg.get")),
        };
    }
    if arg.starts_with("git@") {
        let (repo, git_ref) = arg.rsplit_once('@').filter(|(r, _)| r.contains(':')).unwrap_or((arg, ""));
        return Ok(ParsedArg::Resolved(GitArg {
            repo: repo.to_string(),
            directory: "/".to_string(),
            git_ref: git_ref.to_string(),
        }));
    }
    Err(Error::invalid_param(format!(
        "{:?}: cannot tell the repository from the directory; use <repo>.git[/<dir>][@<ref>]",
        arg
    ))
    .with_op("pkg.get"))
}

/// Splits `segments` into a ref and a directory. The longest prefix that is
/// a known ref wins; with no match the first segment is the ref.
pub fn pick_split(segments: &[String], known: impl Fn(&str) -> bool) -> (String, String) {
    for n in (1..=segments.len()).rev() {
        let candidate = segments[..n].join("/");
        if known(&candidate) {
            return (candidate, normalize_dir(&segments[n..].join("/")));
        }
    }
    let first = segments.first().cloned().unwrap_or_default();
    let rest = segments.get(1..).map(|s| s.join("/")).unwrap_or_default();
    (first, normalize_dir(&rest))
}

/// Parses `arg`, asking the remote for its refs when the split is ambiguous.
pub async fn resolve_git_arg(git: &GitCli, arg: &str, cancel: &CancellationToken) -> Result<GitArg> {
    match parse_git_arg(arg)? {
        ParsedArg::Resolved(a) => Ok(a),
        ParsedArg::Ambiguous { repo, segments } if segments.len() == 1 => {
            Ok(GitArg { repo, directory: "/".to_string(), git_ref: segments[0].clone() })
        }
        ParsedArg::Ambiguous { repo, segments } => {
            let refs = retry_transport("git.ls_remote", git.backoff(), cancel, || git.ls_remote(&repo, cancel)).await?;
            let (git_ref, directory) = pick_split(&segments, |c| refs.has(c));
            Ok(GitArg { repo, directory, git_ref })
        }
    }
}
