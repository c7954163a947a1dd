//! kpt packages: the Kptfile model and reading/writing package directories.

#![forbid(unsafe_code)]

pub mod fileset;
pub mod io;
pub mod kptfile;

pub use fileset::FileSet;
pub use io::{read_package, read_resources, replace_resources, write_package, write_resources, ReadOptions, MANIFEST_FILE};
pub use kptfile::{
    Condition, ConditionStatus, Function, GitLock, GitSource, Inventory, Kptfile, OciLock, OciSource, OriginType,
    PackageInfo, Pipeline, ReadinessGate, Status, UpdateStrategy, Upstream, UpstreamLock,
};

use kpt_core::{Error, Result, ResultExt, KPTFILE_NAME};
use kpt_yaml::Resource;

/// Parses the Kptfile of the package rooted at the top of `files`.
pub fn kptfile_of(files: &FileSet) -> Result<Kptfile> {
    Kptfile::from_resource(&kptfile_resource(files)?)
}

/// The Kptfile as a resource, keeping comments for in-place edits.
pub fn kptfile_resource(files: &FileSet) -> Result<Resource> {
    let text = files
        .get_str(KPTFILE_NAME)
        .ok_or_else(|| Error::not_found("package has no Kptfile").with_op("pkg.kptfile"))?;
    let mut docs = kpt_yaml::parse_stream(text).at_path(KPTFILE_NAME).op("pkg.kptfile")?;
    if docs.len() != 1 {
        return Err(Error::parse("Kptfile must hold exactly one document").with_op("pkg.kptfile"));
    }
    let mut r = docs.remove(0);
    r.set_location(KPTFILE_NAME, 0);
    Ok(r)
}

/// Writes a Kptfile resource back into `files`.
pub fn put_kptfile(files: &mut FileSet, kptfile: &Resource) {
    files.insert(KPTFILE_NAME, kptfile.without_internal_annotations().body());
}
