//! Typed Kptfile model.
//!
//! Reading goes through [`Kptfile::from_resource`], which rejects unknown
//! fields and validates the pipeline and inventory. Writes that must keep the
//! user's comments go through [`set_field`] on the resource instead of
//! re-serializing the whole struct.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kpt_core::{Error, ImageRef, Result, ResultExt, KPTFILE_API_VERSION, KPTFILE_KIND};
use kpt_yaml::{Node, Resource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    #[default]
    ResourceMerge,
    FastForward,
    ForceDeleteReplace,
    CopyMerge,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::ResourceMerge => "resource-merge",
            UpdateStrategy::FastForward => "fast-forward",
            UpdateStrategy::ForceDeleteReplace => "force-delete-replace",
            UpdateStrategy::CopyMerge => "copy-merge",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resource-merge" => Ok(UpdateStrategy::ResourceMerge),
            "fast-forward" => Ok(UpdateStrategy::FastForward),
            "force-delete-replace" => Ok(UpdateStrategy::ForceDeleteReplace),
            "copy-merge" => Ok(UpdateStrategy::CopyMerge),
            other => Err(Error::invalid_param(format!("unknown update strategy {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Git,
    Oci,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitSource {
    pub repo: String,
    #[serde(default, alias = "dir")]
    pub directory: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    /// Older Kptfiles pin the strategy inside the git block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OciSource {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Upstream {
    #[serde(rename = "type")]
    pub origin: OriginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

impl Upstream {
    pub fn git(repo: &str, directory: &str, git_ref: &str) -> Self {
        Upstream {
            origin: OriginType::Git,
            git: Some(GitSource {
                repo: repo.to_string(),
                directory: directory.to_string(),
                git_ref: git_ref.to_string(),
                update_strategy: None,
            }),
            oci: None,
            update_strategy: None,
        }
    }

    pub fn oci(image: &str) -> Self {
        Upstream {
            origin: OriginType::Oci,
            git: None,
            oci: Some(OciSource { image: image.to_string() }),
            update_strategy: None,
        }
    }

    /// Effective strategy: upstream-level, then git-level, then resource-merge.
    pub fn strategy(&self) -> UpdateStrategy {
        self.update_strategy
            .or_else(|| self.git.as_ref().and_then(|g| g.update_strategy))
            .unwrap_or_default()
    }

    pub fn with_strategy(mut self, strategy: Option<UpdateStrategy>) -> Self {
        self.update_strategy = strategy;
        if let Some(g) = self.git.as_mut() {
            g.update_strategy = None;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitLock {
    pub repo: String,
    #[serde(default, alias = "dir")]
    pub directory: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OciLock {
    pub image: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamLock {
    #[serde(rename = "type")]
    pub origin: OriginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciLock>,
}

impl UpstreamLock {
    pub fn git(lock: GitLock) -> Self {
        UpstreamLock { origin: OriginType::Git, git: Some(lock), oci: None }
    }

    pub fn oci(lock: OciLock) -> Self {
        UpstreamLock { origin: OriginType::Oci, git: None, oci: Some(lock) }
    }

    /// The upstream that fetches exactly this pin.
    pub fn to_upstream(&self) -> Upstream {
        match (&self.git, &self.oci) {
            (Some(g), _) => Upstream::git(&g.repo, &g.directory, &g.commit),
            (None, Some(o)) => Upstream::oci(&format!("{}@{}", strip_reference(&o.image), o.digest)),
            (None, None) => Upstream { origin: self.origin, git: None, oci: None, update_strategy: None },
        }
    }
}

/// Drops any tag or digest from an image reference.
fn strip_reference(image: &str) -> String {
    match ImageRef::parse(image) {
        Ok(r) if !r.name.is_empty() => r.name,
        _ => image.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadinessGate {
    pub condition_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<ReadinessGate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Function {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

impl Function {
    pub fn image(image: &str) -> Self {
        Function { image: Some(image.to_string()), ..Default::default() }
    }

    /// Human label used in logs and render results.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().or(self.image.as_deref()).or(self.exec.as_deref()).unwrap_or("<unnamed>")
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.image, &self.exec) {
            (Some(_), Some(_)) => return Err(Error::invalid_param("function sets both image and exec")),
            (None, None) => return Err(Error::missing_param("function needs image or exec")),
            (Some(image), None) => {
                ImageRef::parse(image)?;
            }
            (None, Some(exec)) if exec.trim().is_empty() => {
                return Err(Error::missing_param("function exec is empty"));
            }
            _ => {}
        }
        if self.config_map.is_some() && self.config_path.is_some() {
            return Err(Error::invalid_param(format!(
                "function {}: at most one of configMap and configPath may be set",
                self.display_name()
            )));
        }
        if let Some(p) = &self.config_path {
            validate_config_path(p)?;
        }
        Ok(())
    }
}

/// `configPath` must stay inside the package: relative, POSIX, no `..`.
pub fn validate_config_path(p: &str) -> Result<()> {
    let bad = |why: &str| Error::invalid_param(format!("configPath {:?}: {}", p, why));
    if p.is_empty() {
        return Err(bad("empty"));
    }
    if p.starts_with('/') || p.contains('\\') || p.contains(':') {
        return Err(bad("must be a relative POSIX path"));
    }
    if p.split('/').any(|c| c == "..") {
        return Err(bad("must not leave the package"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<Function>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Function>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty() && self.validators.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "inventoryID", skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Inventory {
    pub fn validate(&self) -> Result<()> {
        for (field, v) in [("namespace", &self.namespace), ("name", &self.name), ("inventoryID", &self.inventory_id)] {
            if let Some(v) = v {
                if v.trim().is_empty() {
                    return Err(Error::invalid_param(format!("inventory.{} is empty", field)));
                }
            }
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.name.is_some() || self.namespace.is_some() || self.inventory_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Status {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Kptfile {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<PackageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Kptfile {
    pub fn new(name: &str) -> Self {
        let mut metadata = ObjectMeta { name: name.to_string(), ..Default::default() };
        metadata.annotations.insert(kpt_core::LOCAL_CONFIG_ANNOTATION.to_string(), "true".to_string());
        Kptfile {
            api_version: KPTFILE_API_VERSION.to_string(),
            kind: KPTFILE_KIND.to_string(),
            metadata,
            upstream: None,
            upstream_lock: None,
            info: None,
            pipeline: None,
            inventory: None,
            status: None,
        }
    }

    pub fn from_resource(r: &Resource) -> Result<Self> {
        let mut clean = r.without_internal_annotations();
        if let Some(m) = clean.root_mut().get_mut("metadata") {
            if m.get("annotations").map(Node::is_null).unwrap_or(false) {
                m.remove("annotations");
            }
        }
        let kf: Kptfile = clean.decode().op("kptfile.read")?;
        kf.validate().op("kptfile.validate")?;
        Ok(kf)
    }

    pub fn from_yaml(src: &str) -> Result<Self> {
        let docs = kpt_yaml::parse_stream(src).op("kptfile.read")?;
        match docs.as_slice() {
            [one] => Self::from_resource(one),
            _ => Err(Error::parse(format!("Kptfile must hold exactly one document, found {}", docs.len()))
                .with_op("kptfile.read")),
        }
    }

    pub fn to_resource(&self) -> Result<Resource> {
        Resource::from_value(self)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(self.to_resource()?.body())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_version != KPTFILE_API_VERSION || self.kind != KPTFILE_KIND {
            return Err(Error::parse(format!(
                "expected {}/{} but found {}/{}",
                KPTFILE_API_VERSION, KPTFILE_KIND, self.api_version, self.kind
            )));
        }
        if let Some(p) = &self.pipeline {
            for f in p.mutators.iter().chain(&p.validators) {
                f.validate()?;
            }
        }
        if let Some(inv) = &self.inventory {
            inv.validate()?;
        }
        if let Some(up) = &self.upstream {
            match up.origin {
                OriginType::Git if up.git.as_ref().map(|g| g.repo.is_empty()).unwrap_or(true) => {
                    return Err(Error::missing_param("upstream.git.repo is required for type git"));
                }
                OriginType::Oci if up.oci.as_ref().map(|o| o.image.is_empty()).unwrap_or(true) => {
                    return Err(Error::missing_param("upstream.oci.image is required for type oci"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn strategy(&self) -> UpdateStrategy {
        self.upstream.as_ref().map(Upstream::strategy).unwrap_or_default()
    }

    pub fn readiness_gates(&self) -> Vec<String> {
        self.info
            .as_ref()
            .map(|i| i.readiness_gates.iter().map(|g| g.condition_type.clone()).collect())
            .unwrap_or_default()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.condition_type == condition_type)
    }
}

/// Sets a top-level Kptfile field on the resource, keeping comments elsewhere
/// in the document. `None` removes the field.
pub fn set_field<T: Serialize>(kptfile: &mut Resource, key: &str, value: Option<&T>) -> Result<()> {
    match value {
        Some(v) => {
            let node = Node::encode(v)?;
            kptfile.root_mut().set(key, node);
        }
        None => {
            kptfile.root_mut().remove(key);
        }
    }
    Ok(())
}

/// Records a fetch in the Kptfile: `upstream` (keeping the user's strategy)
/// and `upstreamLock`.
pub fn set_upstream(kptfile: &mut Resource, upstream: &Upstream, lock: &UpstreamLock) -> Result<()> {
    let existing = Kptfile::from_resource(kptfile).ok().and_then(|k| k.upstream);
    let strategy = upstream
        .update_strategy
        .or_else(|| existing.as_ref().and_then(|u| u.update_strategy.or_else(|| u.git.as_ref().and_then(|g| g.update_strategy))));
    let upstream = upstream.clone().with_strategy(strategy);
    set_field(kptfile, "upstream", Some(&upstream))?;
    set_field(kptfile, "upstreamLock", Some(lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ErrorKind;

    const KPTFILE: &str = r#"apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: wordpress
  annotations:
    config.kubernetes.io/local-config: "true"
upstream:
  type: git
  git:
    repo: https://github.com/kptdev/kpt
    directory: /package-examples/wordpress
    ref: v0.9
  updateStrategy: resource-merge
upstreamLock:
  type: git
  git:
    repo: https://github.com/kptdev/kpt
    directory: /package-examples/wordpress
    ref: package-examples/wordpress/v0.9
    commit: b9ea0bca019dafa9f9f91fd428385597c708518c
info:
  description: sample
  readinessGates:
  - conditionType: foo
pipeline:
  mutators:
  - image: ghcr.io/kptdev/krm-functions-catalog/set-labels:v0.2.0
    configMap:
      app: wordpress
  validators:
  - image: ghcr.io/kptdev/krm-functions-catalog/kubeval:v0.3
"#;

    #[test]
    fn reads_a_full_kptfile() {
        let kf = Kptfile::from_yaml(KPTFILE).unwrap();
        assert_eq!(kf.metadata.name, "wordpress");
        assert_eq!(kf.strategy(), UpdateStrategy::ResourceMerge);
        let lock = kf.upstream_lock.as_ref().unwrap().git.as_ref().unwrap();
        assert_eq!(lock.commit, "b9ea0bca019dafa9f9f91fd428385597c708518c");
        assert_eq!(kf.readiness_gates(), vec!["foo".to_string()]);
        assert_eq!(kf.pipeline.as_ref().unwrap().mutators.len(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let src = KPTFILE.replace("info:\n", "bogus: 1\ninfo:\n");
        let err = Kptfile::from_yaml(&src).unwrap_err();
        assert!(err.is(ErrorKind::ParseError), "{}", err);
        let src = KPTFILE.replace("    ref: v0.9\n", "    ref: v0.9\n    branch: x\n");
        assert!(Kptfile::from_yaml(&src).is_err());
    }

    #[test]
    fn legacy_git_level_strategy_and_dir_alias() {
        let src = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: x\nupstream:\n  type: git\n  git:\n    repo: r\n    dir: /a\n    ref: main\n    updateStrategy: fast-forward\n";
        let kf = Kptfile::from_yaml(src).unwrap();
        assert_eq!(kf.strategy(), UpdateStrategy::FastForward);
        assert_eq!(kf.upstream.unwrap().git.unwrap().directory, "/a");
    }

    #[test]
    fn function_validation() {
        let mut f = Function::image("ghcr.io/x/y:v1");
        f.config_map = Some(BTreeMap::new());
        f.config_path = Some("cfg.yaml".into());
        assert!(f.validate().unwrap_err().is(ErrorKind::InvalidParam));
        f.config_map = None;
        assert!(f.validate().is_ok());
        for bad in ["../x.yaml", "/abs.yaml", "a/../../b", "c:\\x"] {
            f.config_path = Some(bad.into());
            assert!(f.validate().is_err(), "{}", bad);
        }
        assert!(Function::image("Not An Image").validate().is_err());
        assert!(Function::default().validate().unwrap_err().is(ErrorKind::MissingParam));
    }

    #[test]
    fn empty_inventory_fields_fail() {
        let src = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: x\ninventory:\n  namespace: ''\n  name: inv\n";
        assert!(Kptfile::from_yaml(src).unwrap_err().is(ErrorKind::InvalidParam));
    }

    #[test]
    fn set_upstream_keeps_comments_and_strategy() {
        let src = "# package manifest\napiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: x # the name\nupstream:\n  type: git\n  git:\n    repo: r\n    directory: /\n    ref: main\n  updateStrategy: fast-forward\n";
        let mut docs = kpt_yaml::parse_stream(src).unwrap();
        let lock = UpstreamLock::git(GitLock { repo: "r".into(), directory: "/".into(), git_ref: "v2".into(), commit: "abc".into() });
        set_upstream(&mut docs[0], &Upstream::git("r", "/", "v2"), &lock).unwrap();
        let out = docs[0].body();
        assert!(out.starts_with("# package manifest\n"));
        assert!(out.contains("name: x # the name"));
        let kf = Kptfile::from_yaml(&out).unwrap();
        assert_eq!(kf.strategy(), UpdateStrategy::FastForward);
        assert_eq!(kf.upstream_lock.unwrap().git.unwrap().commit, "abc");
    }

    #[test]
    fn new_kptfile_round_trips() {
        let kf = Kptfile::new("pkg");
        let yaml = kf.to_yaml().unwrap();
        assert!(yaml.starts_with("apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: pkg\n"));
        assert_eq!(Kptfile::from_yaml(&yaml).unwrap(), kf);
    }
}
