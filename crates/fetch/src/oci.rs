//! OCI images carrying package contents.
//!
//! An image holds one gzip tar layer with the package files. The config's
//! history entries carry free-form comments; the repository store uses them
//! to record the task that produced a revision. [`LayoutRegistry`] keeps
//! images as OCI image layouts on disk, one layout per image name.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kpt_core::{CancellationToken, Error, ImageRef, Result};
use kpt_pkg::{FileSet, OciLock, Upstream, UpstreamLock};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::retry::retry_transport;
use crate::{Fetched, Fetcher};

const OCI_LAYOUT_VERSION: &str = "1.0.0";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const REF_NAME: &str = "org.opencontainers.image.ref.name";
/// Fixed mtime so equal contents produce equal layers.
const LAYER_MTIME: u64 = 1_704_067_200;

/// A pulled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub files: FileSet,
    /// Manifest digest, `sha256:<hex>`.
    pub digest: String,
    /// History comments, oldest first.
    pub history: Vec<String>,
}

/// Registry operations the fetcher and the OCI repository store need.
/// Image arguments are `name[:tag|@digest]`; a bare name means `latest`.
///
/// The only implementation here is [`LayoutRegistry`], which maps every
/// image name, registry host included, onto an on-disk image layout and
/// never talks to a remote registry. Pulling from or pushing to a real
/// registry needs another client behind this trait.
#[async_trait]
pub trait OciClient: Send + Sync {
    /// Stores `files` as `image` and returns the manifest digest.
    async fn push(&self, image: &str, files: &FileSet, history: &[String]) -> Result<String>;
    async fn pull(&self, image: &str) -> Result<Image>;
    /// Points `name:tag` at the manifest `image` resolves to.
    async fn tag(&self, image: &str, tag: &str) -> Result<()>;
    async fn delete_tag(&self, image: &str) -> Result<()>;
    async fn tags(&self, name: &str) -> Result<Vec<String>>;
    /// Image names under `prefix`.
    async fn repositories(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct History {
    created: String,
    created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    empty_layer: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Rootfs {
    #[serde(rename = "type")]
    rootfs_type: String,
    diff_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Config {
    created: String,
    architecture: String,
    os: String,
    rootfs: Rootfs,
    #[serde(default)]
    history: Vec<History>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Layout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn tar_files(files: &FileSet) -> Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    for (path, content) in files.iter() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_mtime(LAYER_MTIME);
        header.set_cksum();
        archive.append_data(&mut header, path, content)?;
    }
    Ok(archive.into_inner()?)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Unpacks a gzip tar layer, rejecting entries that escape the package.
pub fn unpack_layer(data: &[u8]) -> Result<FileSet> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = FileSet::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        if path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::parse(format!("layer entry {:?} escapes the package", path)).with_op("oci.pull"));
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        files.insert(path, content);
    }
    Ok(files)
}

/// Images stored as OCI image layouts under a root directory.
#[derive(Clone)]
pub struct LayoutRegistry {
    root: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl LayoutRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(LayoutStore) -> Result<T> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let store = LayoutStore { root: self.root.clone() };
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| Error::internal(format!("layout task failed: {}", e)))?
    }
}

struct LayoutStore {
    root: PathBuf,
}

/// Splits an image into its name and a tag or digest selector.
fn split_image(image: &str) -> Result<(String, Selector)> {
    let r = ImageRef::parse(image)?;
    if r.name.is_empty() {
        return Err(Error::invalid_param(format!("image {:?} has no repository name", image)));
    }
    let sel = match (r.digest, r.tag) {
        (Some(d), _) => Selector::Digest(d),
        (None, Some(t)) => Selector::Tag(t),
        (None, None) => Selector::Tag("latest".to_string()),
    };
    Ok((r.name, sel))
}

enum Selector {
    Tag(String),
    Digest(String),
}

impl LayoutStore {
    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name.replace(':', "_"))
    }

    fn blob_path(&self, name: &str, digest: &str) -> PathBuf {
        self.dir(name).join("blobs/sha256").join(digest.trim_start_matches("sha256:"))
    }

    fn write_blob(&self, name: &str, data: &[u8]) -> Result<Descriptor> {
        let digest = sha256_digest(data);
        let path = self.blob_path(name, &digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(Descriptor { media_type: String::new(), digest, size: data.len() as u64, annotations: BTreeMap::new() })
    }

    fn read_blob(&self, name: &str, digest: &str) -> Result<Vec<u8>> {
        let data = std::fs::read(self.blob_path(name, digest))
            .map_err(|_| Error::not_found(format!("blob {} missing from {}", digest, name)).with_op("oci.pull"))?;
        if sha256_digest(&data) != digest {
            return Err(Error::internal(format!("blob {} in {} is corrupt", digest, name)).with_op("oci.pull"));
        }
        Ok(data)
    }

    fn read_index(&self, name: &str) -> Result<Index> {
        let path = self.dir(name).join("index.json");
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(format!("image {} not found", name))),
            Err(e) => Err(e.into()),
        }
    }

    fn write_index(&self, name: &str, index: &Index) -> Result<()> {
        let dir = self.dir(name);
        std::fs::create_dir_all(&dir)?;
        let layout = Layout { image_layout_version: OCI_LAYOUT_VERSION.to_string() };
        std::fs::write(dir.join("oci-layout"), serde_json::to_vec_pretty(&layout)?)?;
        std::fs::write(dir.join("index.json"), serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }

    fn resolve(&self, image: &str) -> Result<(String, Descriptor)> {
        let (name, sel) = split_image(image)?;
        let index = self.read_index(&name).map_err(|e| e.with_op("oci.resolve"))?;
        let found = index.manifests.into_iter().find(|d| match &sel {
            Selector::Tag(t) => d.annotations.get(REF_NAME) == Some(t),
            Selector::Digest(dg) => &d.digest == dg,
        });
        let desc = found.ok_or_else(|| Error::not_found(format!("image {} not found", image)).with_op("oci.resolve"))?;
        Ok((name, desc))
    }

    fn set_tag(&self, name: &str, desc: &Descriptor, tag: &str) -> Result<()> {
        let mut index = match self.read_index(name) {
            Ok(i) => i,
            Err(e) if e.is(kpt_core::ErrorKind::NotFound) => {
                Index { schema_version: 2, media_type: INDEX_MEDIA_TYPE.to_string(), manifests: Vec::new() }
            }
            Err(e) => return Err(e),
        };
        index.manifests.retain(|d| d.annotations.get(REF_NAME).map(String::as_str) != Some(tag));
        let mut desc = desc.clone();
        desc.annotations = BTreeMap::from([(REF_NAME.to_string(), tag.to_string())]);
        index.manifests.push(desc);
        self.write_index(name, &index)
    }

    fn push(&self, image: &str, files: &FileSet, history: &[String]) -> Result<String> {
        let (name, sel) = split_image(image)?;
        let Selector::Tag(tag) = sel else {
            return Err(Error::invalid_param(format!("push target {:?} must be a tag", image)).with_op("oci.push"));
        };
        let raw = tar_files(files)?;
        let layer_data = gzip(&raw)?;
        let mut layer = self.write_blob(&name, &layer_data)?;
        layer.media_type = LAYER_MEDIA_TYPE.to_string();

        let created = chrono::Utc::now().to_rfc3339();
        let mut entries: Vec<History> = history
            .iter()
            .map(|c| History { created: created.clone(), created_by: "kpt".to_string(), comment: Some(c.clone()), empty_layer: true })
            .collect();
        match entries.last_mut() {
            Some(last) => last.empty_layer = false,
            None => entries.push(History { created: created.clone(), created_by: "kpt".to_string(), comment: None, empty_layer: false }),
        }
        let config = Config {
            created,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: Rootfs { rootfs_type: "layers".to_string(), diff_ids: vec![sha256_digest(&raw)] },
            history: entries,
        };
        let mut config_desc = self.write_blob(&name, &serde_json::to_vec_pretty(&config)?)?;
        config_desc.media_type = CONFIG_MEDIA_TYPE.to_string();

        let manifest = Manifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: config_desc,
            layers: vec![layer],
        };
        let mut manifest_desc = self.write_blob(&name, &serde_json::to_vec_pretty(&manifest)?)?;
        manifest_desc.media_type = MANIFEST_MEDIA_TYPE.to_string();
        self.set_tag(&name, &manifest_desc, &tag)?;
        Ok(manifest_desc.digest)
    }

    fn pull(&self, image: &str) -> Result<Image> {
        let (name, desc) = self.resolve(image)?;
        let manifest: Manifest = serde_json::from_slice(&self.read_blob(&name, &desc.digest)?)?;
        let [layer] = manifest.layers.as_slice() else {
            return Err(Error::parse(format!("image {} has {} layers; expected one", image, manifest.layers.len())).with_op("oci.pull"));
        };
        let files = unpack_layer(&self.read_blob(&name, &layer.digest)?)?;
        let config: Config = serde_json::from_slice(&self.read_blob(&name, &manifest.config.digest)?)?;
        let history = config.history.into_iter().filter_map(|h| h.comment).collect();
        Ok(Image { files, digest: desc.digest, history })
    }

    fn tags(&self, name: &str) -> Result<Vec<String>> {
        let index = match self.read_index(name) {
            Ok(i) => i,
            Err(e) if e.is(kpt_core::ErrorKind::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut tags: Vec<String> = index.manifests.into_iter().filter_map(|mut d| d.annotations.remove(REF_NAME)).collect();
        tags.sort();
        Ok(tags)
    }

    fn delete_tag(&self, image: &str) -> Result<()> {
        let (name, sel) = split_image(image)?;
        let Selector::Tag(tag) = sel else {
            return Err(Error::invalid_param(format!("{:?} is not a tag", image)).with_op("oci.delete"));
        };
        let mut index = self.read_index(&name)?;
        let before = index.manifests.len();
        index.manifests.retain(|d| d.annotations.get(REF_NAME) != Some(&tag));
        if index.manifests.len() == before {
            return Err(Error::not_found(format!("tag {} not found", image)).with_op("oci.delete"));
        }
        self.write_index(&name, &index)
    }

    fn repositories(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_name() != "oci-layout" {
                continue;
            }
            let Some(dir) = entry.path().parent() else { continue };
            let Ok(rel) = dir.strip_prefix(&self.root) else { continue };
            let name = rel.to_string_lossy().replace('\\', "/");
            if name.starts_with(prefix) {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl OciClient for LayoutRegistry {
    async fn push(&self, image: &str, files: &FileSet, history: &[String]) -> Result<String> {
        let (image, files, history) = (image.to_string(), files.clone(), history.to_vec());
        let digest = self.blocking(move |s| s.push(&image, &files, &history)).await?;
        counter!("kpt_oci_push_total", 1u64);
        Ok(digest)
    }

    async fn pull(&self, image: &str) -> Result<Image> {
        let image = image.to_string();
        self.blocking(move |s| s.pull(&image)).await
    }

    async fn tag(&self, image: &str, tag: &str) -> Result<()> {
        let (image, tag) = (image.to_string(), tag.to_string());
        self.blocking(move |s| {
            let (name, desc) = s.resolve(&image)?;
            s.set_tag(&name, &desc, &tag)
        })
        .await
    }

    async fn delete_tag(&self, image: &str) -> Result<()> {
        let image = image.to_string();
        self.blocking(move |s| s.delete_tag(&image)).await
    }

    async fn tags(&self, name: &str) -> Result<Vec<String>> {
        let name = name.to_string();
        self.blocking(move |s| s.tags(&name)).await
    }

    async fn repositories(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |s| s.repositories(&prefix)).await
    }
}

pub struct OciFetcher {
    client: Arc<dyn OciClient>,
    backoff: Duration,
}

impl OciFetcher {
    pub fn new(client: Arc<dyn OciClient>) -> Self {
        Self { client, backoff: Duration::from_millis(500) }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<Image> {
        retry_transport("oci.pull", self.backoff, cancel, || self.client.pull(image)).await
    }
}

#[async_trait]
impl Fetcher for OciFetcher {
    fn validate(&self, upstream: &Upstream) -> Result<()> {
        let oci = upstream.oci.as_ref().ok_or_else(|| Error::missing_param("upstream.oci is required").with_op("oci.validate"))?;
        ImageRef::parse(&oci.image).map_err(|e| e.with_op("oci.validate"))?;
        Ok(())
    }

    async fn fetch(&self, upstream: &Upstream, cancel: &CancellationToken) -> Result<Fetched> {
        self.validate(upstream)?;
        let t0 = Instant::now();
        let image = upstream.oci.as_ref().map(|o| o.image.clone()).unwrap_or_default();
        let pulled = self.pull(&image, cancel).await?;
        histogram!("kpt_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_fetch_total", 1u64, "origin" => "oci");
        info!(%image, digest = %pulled.digest, files = pulled.files.len(), took_ms = %t0.elapsed().as_millis(), "fetched oci upstream");
        Ok(Fetched { files: pulled.files, lock: UpstreamLock::oci(OciLock { image, digest: pulled.digest }) })
    }

    async fn fetch_locked(&self, lock: &UpstreamLock, cancel: &CancellationToken) -> Result<Fetched> {
        let oci = lock.oci.as_ref().ok_or_else(|| Error::missing_param("upstreamLock.oci is required").with_op("oci.fetch"))?;
        let pinned = ImageRef::parse(&oci.image)?;
        let by_digest = format!("{}@{}", pinned.name, oci.digest);
        let pulled = self.pull(&by_digest, cancel).await?;
        debug!(image = %by_digest, "fetched locked oci upstream");
        Ok(Fetched { files: pulled.files, lock: lock.clone() })
    }
}
