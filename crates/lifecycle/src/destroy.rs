use std::path::Path;

use kpt_core::{Error, Result, ResultExt, KPTFILE_NAME};
use tracing::info;

/// Removes a local package directory. Refuses directories without a Kptfile.
pub fn destroy(dir: &Path) -> Result<()> {
    if !dir.join(KPTFILE_NAME).is_file() {
        return Err(Error::not_found(format!("{} is not a kpt package", dir.display())).with_path(dir).with_op("pkg.destroy"));
    }
    std::fs::remove_dir_all(dir).at_path(dir).op("pkg.destroy")?;
    info!(pkg = %dir.display(), "removed package");
    Ok(())
}
