//! Local package lifecycle: `get`, `update`, `init` and `destroy`.

#![forbid(unsafe_code)]

pub mod destroy;
pub mod get;
pub mod init;
pub mod update;

use std::path::Path;
use std::sync::Arc;

use kpt_core::{Error, Result, ResultExt, KPTFILE_NAME};
use kpt_fetch::{Fetcher, GitCli};
use kpt_yaml::Resource;

pub use destroy::destroy;
pub use get::{GetOptions, GetReport};
pub use init::{init, init_inventory, InitOptions, InventoryOptions};
pub use update::{UpdateOptions, UpdateReport};

/// Runs the operations that talk to upstreams.
pub struct Lifecycle {
    fetcher: Arc<dyn Fetcher>,
    git: Option<Arc<GitCli>>,
}

impl Lifecycle {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher, git: None }
    }

    /// Enables the uncommitted-changes check before a resource merge.
    pub fn with_git(mut self, git: Arc<GitCli>) -> Self {
        self.git = Some(git);
        self
    }
}

/// Reads `<dir>/Kptfile` as a resource.
pub fn read_kptfile(dir: &Path) -> Result<Resource> {
    let path = dir.join(KPTFILE_NAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!("{} is not a kpt package", dir.display())).with_path(dir));
        }
        Err(e) => return Err(Error::from(e).with_path(&path)),
    };
    let mut docs = kpt_yaml::parse_stream(&text).at_path(&path)?;
    if docs.len() != 1 {
        return Err(Error::parse("Kptfile must hold exactly one document").with_path(&path));
    }
    Ok(docs.remove(0))
}

pub fn write_kptfile(dir: &Path, kptfile: &Resource) -> Result<()> {
    let path = dir.join(KPTFILE_NAME);
    std::fs::write(&path, kptfile.without_internal_annotations().body()).at_path(&path)
}

/// Last path component, used as the default package name.
pub(crate) fn dir_name(dir: &Path) -> String {
    dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "package".to_string())
}
