//! Typed paths into the standardized database layout.
//!
//! Centralizing path construction keeps file access consistent across the
//! pipeline stages and prevents drift when the layout evolves.
use std::path::{Path, PathBuf};

/// Directory under the database root that holds standardized subjects.
pub const DWI_ML_READY_DIR: &str = "dwi_ml_ready";

/// Conventional sub-directories inside a standardized subject directory.
pub const SUBJECT_SUBDIRS: [&str; 4] = ["dwi", "anat", "masks", "bundles"];

/// Staging area used while a subject directory is being built.
const STAGE_DIR: &str = ".stage";

/// Convenience wrapper for locating artifacts under a database folder.
#[derive(Debug, Clone)]
pub struct DatabasePaths {
    root: PathBuf,
}

impl DatabasePaths {
    /// Create a new path helper rooted at the database folder.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Return the database root used for path derivation.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `dwi_ml_ready/` directory path.
    pub fn ready_dir(&self) -> PathBuf {
        self.root.join(DWI_ML_READY_DIR)
    }

    /// Return the standardized directory for one subject.
    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.ready_dir().join(subject)
    }

    /// Return a file inside a subject directory from a relative path.
    pub fn subject_file(&self, subject: &str, rel: &str) -> PathBuf {
        self.subject_dir(subject).join(rel)
    }

    /// Return the staging directory used while building a subject.
    pub fn stage_dir(&self, subject: &str) -> PathBuf {
        self.ready_dir().join(STAGE_DIR).join(subject)
    }

    /// Return the staging root shared by all in-flight subjects.
    pub fn stage_root(&self) -> PathBuf {
        self.ready_dir().join(STAGE_DIR)
    }
}

/// Replace the `*` wildcard in a configured relative path by the subject id.
pub fn expand_for_subject(rel: &str, subject: &str) -> String {
    rel.replace('*', subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_paths_follow_layout() {
        let paths = DatabasePaths::new(PathBuf::from("/data/db"));
        assert_eq!(
            paths.subject_dir("subjA"),
            PathBuf::from("/data/db/dwi_ml_ready/subjA")
        );
        assert_eq!(
            paths.subject_file("subjA", "dwi/dwi.nii.gz"),
            PathBuf::from("/data/db/dwi_ml_ready/subjA/dwi/dwi.nii.gz")
        );
    }

    #[test]
    fn wildcard_expansion() {
        assert_eq!(
            expand_for_subject("masks/*_wm.nii.gz", "subjB"),
            "masks/subjB_wm.nii.gz"
        );
        assert_eq!(expand_for_subject("anat/t1.nii.gz", "subjB"), "anat/t1.nii.gz");
    }
}
