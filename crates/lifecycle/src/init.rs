use std::path::Path;

use kpt_core::{generate_id, Error, Result, ResultExt, KPTFILE_NAME};
use kpt_pkg::{Inventory, Kptfile, PackageInfo};
use rand::Rng;
use tracing::info;

use crate::{dir_name, read_kptfile, write_kptfile};

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Package name; the directory name when unset.
    pub name: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub site: Option<String>,
}

/// Creates `dir` if needed and writes a stub Kptfile into it.
pub fn init(dir: &Path, opts: &InitOptions) -> Result<Kptfile> {
    if dir.join(KPTFILE_NAME).exists() {
        return Err(Error::already_exists(format!("{} already has a Kptfile", dir.display())).with_path(dir).with_op("pkg.init"));
    }
    std::fs::create_dir_all(dir).at_path(dir)?;
    let name = opts.name.clone().unwrap_or_else(|| dir_name(dir));
    let mut kf = Kptfile::new(&name);
    if opts.description.is_some() || !opts.keywords.is_empty() || opts.site.is_some() {
        kf.info = Some(PackageInfo {
            description: opts.description.clone(),
            keywords: opts.keywords.clone(),
            site: opts.site.clone(),
            ..Default::default()
        });
    }
    kf.validate().op("pkg.init")?;
    let path = dir.join(KPTFILE_NAME);
    std::fs::write(&path, kf.to_yaml()?).at_path(&path)?;
    info!(pkg = %dir.display(), name = %name, "initialized package");
    Ok(kf)
}

#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    /// Namespace of the inventory object; `default` when unset.
    pub namespace: Option<String>,
    /// Inventory object name; generated when unset.
    pub name: Option<String>,
    /// Derived from namespace and name when unset.
    pub inventory_id: Option<String>,
    /// Replace an inventory that is already set.
    pub force: bool,
}

/// Binds the package to a cluster inventory by writing `inventory`.
pub fn init_inventory(dir: &Path, opts: &InventoryOptions) -> Result<Inventory> {
    let mut kf = read_kptfile(dir).op("live.init")?;
    let current = Kptfile::from_resource(&kf).op("live.init")?;
    if current.inventory.as_ref().map(Inventory::is_set).unwrap_or(false) && !opts.force {
        return Err(Error::already_exists("inventory is already set; use --force to replace it")
            .with_path(dir)
            .with_op("live.init"));
    }
    let namespace = opts.namespace.clone().unwrap_or_else(|| "default".to_string());
    let name = opts
        .name
        .clone()
        .unwrap_or_else(|| format!("inventory-{:08}", rand::thread_rng().gen_range(0..100_000_000u32)));
    let inventory_id = opts.inventory_id.clone().unwrap_or_else(|| generate_id(&namespace, &name));
    let inventory = Inventory {
        namespace: Some(namespace),
        name: Some(name),
        inventory_id: Some(inventory_id),
        ..Default::default()
    };
    inventory.validate().op("live.init")?;
    kpt_pkg::kptfile::set_field(&mut kf, "inventory", Some(&inventory))?;
    write_kptfile(dir, &kf)?;
    info!(pkg = %dir.display(), id = ?inventory.inventory_id, "initialized inventory");
    Ok(inventory)
}
