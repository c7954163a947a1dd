//! Credential resolution for repository access. Credentials never live in
//! the Kptfile; a resolver maps a repository address to what to present.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use kpt_core::config::env_opt;
use kpt_core::Result;

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Token(String),
    SshKey(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Credential::Token(_) => f.write_str("Token(***)"),
            Credential::SshKey(p) => write!(f, "SshKey({})", p.display()),
        }
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Credentials for `repo`, or `None` to access it anonymously.
    async fn resolve(&self, repo: &str) -> Result<Option<Credential>>;
}

/// Reads `KPT_GIT_USERNAME`/`KPT_GIT_PASSWORD`, `KPT_GIT_TOKEN` or
/// `KPT_GIT_SSH_KEY`, in that order, for every repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialResolver for EnvCredentials {
    async fn resolve(&self, _repo: &str) -> Result<Option<Credential>> {
        if let (Some(username), Some(password)) = (env_opt("KPT_GIT_USERNAME"), env_opt("KPT_GIT_PASSWORD")) {
            return Ok(Some(Credential::Basic { username, password }));
        }
        if let Some(token) = env_opt("KPT_GIT_TOKEN") {
            return Ok(Some(Credential::Token(token)));
        }
        Ok(env_opt("KPT_GIT_SSH_KEY").map(|p| Credential::SshKey(PathBuf::from(p))))
    }
}

/// Fixed credentials keyed by repository address prefix; the longest
/// matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: BTreeMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prefix: &str, credential: Credential) -> Self {
        self.entries.insert(prefix.to_string(), credential);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, repo: &str) -> Result<Option<Credential>> {
        Ok(self
            .entries
            .iter()
            .filter(|(prefix, _)| repo.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, c)| c.clone()))
    }
}
