//! Function image references: `name[:tag|@sha256:<hex64>]`.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DOMAIN_COMPONENT: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
const PATH_COMPONENT: &str = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    let domain = format!(r"{dc}(?:\.{dc})*(?::[0-9]+)?", dc = DOMAIN_COMPONENT);
    let pattern = format!(r"^(?:{domain}/)?{pc}(?:/{pc})*$", domain = domain, pc = PATH_COMPONENT);
    Regex::new(&pattern).expect("static image name pattern")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("static tag pattern"));
static DIGEST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("static digest pattern"));

/// Catalog prefix applied to bare function names such as `set-namespace:v0.4.1`.
pub const DEFAULT_FUNCTION_REGISTRY: &str = "ghcr.io/kptdev/krm-functions-catalog/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository name; empty for a bare `sha256:` digest reference.
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_param("image reference is empty"));
        }
        if DIGEST_RE.is_match(s) {
            return Ok(Self { name: String::new(), tag: None, digest: Some(s.to_string()) });
        }
        let (rest, digest) = match s.split_once('@') {
            Some((n, d)) => {
                if !DIGEST_RE.is_match(d) {
                    return Err(Error::invalid_param(format!("image {:?}: digest must be sha256:<64 hex>", s)));
                }
                (n, Some(d.to_string()))
            }
            None => (s, None),
        };
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let at = last_slash + i;
                (&rest[..at], Some(rest[at + 1..].to_string()))
            }
            None => (rest, None),
        };
        if let Some(t) = &tag {
            if !TAG_RE.is_match(t) {
                return Err(Error::invalid_param(format!("image {:?}: invalid tag {:?}", s, t)));
            }
        }
        if !NAME_RE.is_match(name) {
            return Err(Error::invalid_param(format!("image {:?}: name does not match the OCI reference grammar", s)));
        }
        Ok(Self { name: name.to_string(), tag, digest })
    }

    /// Last path component of the repository name, e.g. `set-namespace`.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Prefixes single-component names with the default function catalog.
    pub fn with_default_registry(mut self) -> Self {
        if !self.name.is_empty() && !self.name.contains('/') {
            self.name = format!("{}{}", DEFAULT_FUNCTION_REGISTRY, self.name);
        }
        self
    }
}

impl FromStr for ImageRef {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            return f.write_str(self.digest.as_deref().unwrap_or_default());
        }
        f.write_str(&self.name)?;
        if let Some(t) = &self.tag {
            write!(f, ":{}", t)?;
        }
        if let Some(d) = &self.digest {
            write!(f, "@{}", d)?;
        }
        Ok(())
    }
}
