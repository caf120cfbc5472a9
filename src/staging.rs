//! Stage-then-publish primitives.
//!
//! Prepared data is always built in a staging location and moved into place
//! atomically, so a re-run never deletes existing data before its
//! replacement is complete.
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Copy a source file into a staging directory under a relative path.
pub fn copy_into_staging(staging_root: &Path, rel: &str, source: &Path) -> Result<()> {
    let staged = staging_root.join(rel);
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(source, &staged)
        .with_context(|| format!("copy {} to {}", source.display(), staged.display()))?;
    Ok(())
}

/// Outcome of publishing a staged directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Published,
    SkippedExisting,
}

/// Move a fully staged directory into its final location.
///
/// An existing destination is kept untouched unless `force` is set, in
/// which case it is swapped out only after the replacement is in place.
pub fn publish_dir(staged: &Path, dest: &Path, force: bool) -> Result<Publish> {
    if dest.exists() {
        if !force {
            remove_staged(staged)?;
            return Ok(Publish::SkippedExisting);
        }
        let retired = retired_path(dest)?;
        fs::rename(dest, &retired)
            .with_context(|| format!("retire {}", dest.display()))?;
        if let Err(err) = fs::rename(staged, dest) {
            // Put the previous data back before reporting.
            let _ = fs::rename(&retired, dest);
            return Err(err).with_context(|| format!("publish {}", dest.display()));
        }
        fs::remove_dir_all(&retired)
            .with_context(|| format!("remove retired {}", retired.display()))?;
        return Ok(Publish::Published);
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::rename(staged, dest).with_context(|| format!("publish {}", dest.display()))?;
    Ok(Publish::Published)
}

/// Move a fully written temporary file over its final location.
pub fn publish_file(tmp: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::rename(tmp, dest).with_context(|| format!("publish {}", dest.display()))?;
    Ok(())
}

/// Temporary sibling path used while writing an output file.
pub fn tmp_sibling(dest: &Path) -> Result<PathBuf> {
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid output file name {}", dest.display()))?;
    Ok(dest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.tmp")))
}

fn remove_staged(staged: &Path) -> Result<()> {
    if staged.exists() {
        fs::remove_dir_all(staged)
            .with_context(|| format!("remove staging {}", staged.display()))?;
    }
    Ok(())
}

fn retired_path(dest: &Path) -> Result<PathBuf> {
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid destination {}", dest.display()))?;
    Ok(dest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.retired")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_skips_existing_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("subjA");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "old").unwrap();

        let staged = dir.path().join("stage/subjA");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("keep.txt"), "new").unwrap();

        let outcome = publish_dir(&staged, &dest, false).unwrap();
        assert_eq!(outcome, Publish::SkippedExisting);
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "old");
        assert!(!staged.exists());
    }

    #[test]
    fn publish_replaces_existing_with_force() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("subjA");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "old").unwrap();
        fs::write(dest.join("stale.txt"), "stale").unwrap();

        let staged = dir.path().join("stage/subjA");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("keep.txt"), "new").unwrap();

        let outcome = publish_dir(&staged, &dest, true).unwrap();
        assert_eq!(outcome, Publish::Published);
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "new");
        assert!(!dest.join("stale.txt").exists());
    }

    #[test]
    fn tmp_sibling_stays_in_parent() {
        let tmp = tmp_sibling(Path::new("/data/db/dataset.hdf5")).unwrap();
        assert_eq!(tmp, PathBuf::from("/data/db/.dataset.hdf5.tmp"));
    }
}
