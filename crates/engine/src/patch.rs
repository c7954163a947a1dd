//! Patch tasks: recording a content change as per-file edits and replaying
//! them onto a package.

use kpt_core::{Error, Result};
use kpt_merge::{apply_patch, diff_packages, DiffKind};
use kpt_pkg::FileSet;
use kpt_repository::{PatchSpec, PatchType};

/// Edits turning `old` into `new`, one per changed file, in path order.
pub fn record_patches(old: &FileSet, new: &FileSet) -> Result<Vec<PatchSpec>> {
    diff_packages(old, new)
        .into_iter()
        .map(|d| {
            let (patch_type, contents) = match d.kind {
                DiffKind::Added => (PatchType::CreateFile, d.patch),
                DiffKind::Removed => (PatchType::DeleteFile, String::new()),
                DiffKind::Modified if d.patch.starts_with("Binary files") => {
                    return Err(Error::invalid_param(format!("{} is binary and cannot be patched", d.path)).with_op("engine.patch"));
                }
                DiffKind::Modified => (PatchType::PatchFile, d.patch),
            };
            Ok(PatchSpec { file: d.path, patch_type, contents })
        })
        .collect()
}

pub fn apply_patches(files: &mut FileSet, patches: &[PatchSpec]) -> Result<()> {
    for p in patches {
        match p.patch_type {
            PatchType::CreateFile => {
                if files.contains(&p.file) {
                    return Err(Error::already_exists(format!("patch creates {} but it exists", p.file)).with_op("engine.patch"));
                }
                files.insert(p.file.clone(), p.contents.clone());
            }
            PatchType::DeleteFile => {
                files
                    .remove(&p.file)
                    .ok_or_else(|| Error::not_found(format!("patch deletes {} but it does not exist", p.file)).with_op("engine.patch"))?;
            }
            PatchType::PatchFile => {
                let old = files
                    .get_str(&p.file)
                    .ok_or_else(|| Error::not_found(format!("patch edits {} but it does not exist", p.file)).with_op("engine.patch"))?;
                let new = apply_patch(old, &p.contents).map_err(|e| e.with_path(&p.file))?;
                files.insert(p.file.clone(), new);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_patches_replay_onto_the_old_content() {
        let mut old = FileSet::new();
        old.insert("Kptfile", "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\n");
        old.insert("gone.yaml", "a: 1\n");
        old.insert("cm.yaml", "data:\n  a: \"1\"\n  b: \"2\"\n");
        let mut new = old.clone();
        new.remove("gone.yaml");
        new.insert("cm.yaml", "data:\n  a: \"1\"\n  b: \"3\"\n");
        new.insert("new.yaml", "c: 1\n");

        let patches = record_patches(&old, &new).unwrap();
        let kinds: Vec<(&str, PatchType)> = patches.iter().map(|p| (p.file.as_str(), p.patch_type)).collect();
        assert_eq!(
            kinds,
            vec![("cm.yaml", PatchType::PatchFile), ("gone.yaml", PatchType::DeleteFile), ("new.yaml", PatchType::CreateFile)]
        );

        let mut replayed = old.clone();
        apply_patches(&mut replayed, &patches).unwrap();
        assert_eq!(replayed, new);
    }

    #[test]
    fn deleting_a_missing_file_fails() {
        let patch = PatchSpec { file: "x.yaml".into(), patch_type: PatchType::DeleteFile, contents: String::new() };
        let err = apply_patches(&mut FileSet::new(), &[patch]).unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::NotFound));
    }
}
