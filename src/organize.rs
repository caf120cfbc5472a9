//! Subject standardization from a source derivatives tree.
//!
//! The organization stage is rule-driven: a JSON file declares, for each
//! subject, which source-relative files land where in the standardized
//! `dwi_ml_ready` layout. Rules replace the historical hand-edited shell
//! script with a fixed, documented collaborator interface.
use crate::layout::{expand_for_subject, DatabasePaths, SUBJECT_SUBDIRS};
use crate::subjects::read_subject_list;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::staging::{copy_into_staging, publish_dir, Publish};

/// One mapping rule: a file under `<source_root>/<subject>/` copied to a
/// standardized location under `dwi_ml_ready/<subject>/`. Both sides may
/// contain a `*` wildcard expanded to the subject id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRule {
    pub source: String,
    pub dest: String,
}

/// Inputs for the organization stage.
#[derive(Debug, Clone)]
pub struct OrganizeOptions {
    pub source_root: PathBuf,
    pub database: PathBuf,
    pub subjects_file: PathBuf,
    pub rules_file: PathBuf,
    pub force: bool,
}

/// Per-run summary of what was organized.
#[derive(Debug, Default)]
pub struct OrganizeSummary {
    pub organized: Vec<String>,
    pub skipped: Vec<String>,
}

/// Load layout rules from a JSON file and validate them.
pub fn load_rules(path: &Path) -> Result<Vec<LayoutRule>> {
    let bytes = fs::read(path).with_context(|| format!("read rules {}", path.display()))?;
    let rules: Vec<LayoutRule> = serde_json::from_slice(&bytes).context("parse layout rules JSON")?;
    if rules.is_empty() {
        return Err(anyhow!("layout rules file {} declares no rules", path.display()));
    }
    for rule in &rules {
        validate_rule_path(&rule.source, "source")?;
        validate_rule_path(&rule.dest, "dest")?;
    }
    Ok(rules)
}

/// Standardize every listed subject into the database layout.
///
/// Subjects are built in a staging directory and renamed into place, so an
/// interrupted run never leaves a half-written subject and a re-run never
/// deletes data before its replacement exists. Existing subjects are
/// skipped unless `force` is set.
pub fn run(options: &OrganizeOptions) -> Result<OrganizeSummary> {
    let subjects = read_subject_list(&options.subjects_file)?;
    let rules = load_rules(&options.rules_file)?;
    let paths = DatabasePaths::new(options.database.clone());

    if !options.source_root.is_dir() {
        return Err(anyhow!(
            "source folder {} does not exist",
            options.source_root.display()
        ));
    }
    fs::create_dir_all(paths.ready_dir())
        .with_context(|| format!("create {}", paths.ready_dir().display()))?;

    let mut summary = OrganizeSummary::default();
    for subject in &subjects {
        tracing::info!(%subject, "organizing");
        let staged = paths.stage_dir(subject);
        if staged.exists() {
            fs::remove_dir_all(&staged)
                .with_context(|| format!("clear stale staging {}", staged.display()))?;
        }

        stage_subject(&options.source_root, subject, &rules, &staged)?;

        match publish_dir(&staged, &paths.subject_dir(subject), options.force)? {
            Publish::Published => summary.organized.push(subject.clone()),
            Publish::SkippedExisting => {
                tracing::info!(%subject, "already organized, skipping (use --force to replace)");
                summary.skipped.push(subject.clone());
            }
        }
    }

    // Leave no staging residue behind.
    let stage_root = paths.stage_root();
    if stage_root.exists() && fs::read_dir(&stage_root)?.next().is_none() {
        fs::remove_dir(&stage_root).ok();
    }

    Ok(summary)
}

fn stage_subject(
    source_root: &Path,
    subject: &str,
    rules: &[LayoutRule],
    staged: &Path,
) -> Result<()> {
    let subject_source = source_root.join(subject);
    if !subject_source.is_dir() {
        return Err(anyhow!(
            "subject {subject}: source directory {} not found",
            subject_source.display()
        ));
    }

    // The conventional sub-directories exist even when no rule fills them,
    // so downstream configs can rely on the layout.
    for subdir in SUBJECT_SUBDIRS {
        let path = staged.join(subdir);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }

    for rule in rules {
        let source_rel = expand_for_subject(&rule.source, subject);
        let dest_rel = expand_for_subject(&rule.dest, subject);
        let source = subject_source.join(&source_rel);
        if !source.is_file() {
            return Err(anyhow!(
                "subject {subject}: missing source file {} (rule {} -> {})",
                source.display(),
                rule.source,
                rule.dest
            ));
        }
        copy_into_staging(staged, &dest_rel, &source)?;
    }
    Ok(())
}

fn validate_rule_path(rel: &str, label: &str) -> Result<()> {
    let path = Path::new(rel);
    let escapes = path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir));
    if rel.is_empty() || path.is_absolute() || escapes {
        return Err(anyhow!(
            "rule {label} entries must be relative paths without '..' (got {rel:?})"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_source(root: &Path, subject: &str) {
        let dwi = root.join(subject).join("dti");
        fs::create_dir_all(&dwi).unwrap();
        fs::write(dwi.join(format!("{subject}__dwi.nii.gz")), b"dwi-bytes").unwrap();
        let anat = root.join(subject).join("t1");
        fs::create_dir_all(&anat).unwrap();
        fs::write(anat.join("t1_warped.nii.gz"), b"t1-bytes").unwrap();
    }

    fn write_fixtures(dir: &Path) -> OrganizeOptions {
        let source_root = dir.join("tractoflow");
        for subject in ["subjA", "subjB"] {
            seed_source(&source_root, subject);
        }
        let subjects_file = dir.join("subjects.txt");
        fs::write(&subjects_file, "subjA\nsubjB\n").unwrap();
        let rules_file = dir.join("rules.json");
        fs::write(
            &rules_file,
            r#"[
                {"source": "dti/*__dwi.nii.gz", "dest": "dwi/dwi.nii.gz"},
                {"source": "t1/t1_warped.nii.gz", "dest": "anat/t1.nii.gz"}
            ]"#,
        )
        .unwrap();
        OrganizeOptions {
            source_root,
            database: dir.join("db"),
            subjects_file,
            rules_file,
            force: false,
        }
    }

    #[test]
    fn organizes_subjects_into_standard_layout() {
        let dir = tempfile::tempdir().unwrap();
        let options = write_fixtures(dir.path());
        let summary = run(&options).unwrap();
        assert_eq!(summary.organized, vec!["subjA", "subjB"]);

        let paths = DatabasePaths::new(options.database.clone());
        for subject in ["subjA", "subjB"] {
            assert!(paths.subject_file(subject, "dwi/dwi.nii.gz").is_file());
            assert!(paths.subject_file(subject, "anat/t1.nii.gz").is_file());
            assert!(paths.subject_dir(subject).join("masks").is_dir());
            assert!(paths.subject_dir(subject).join("bundles").is_dir());
        }
        assert!(!paths.stage_root().exists());
    }

    #[test]
    fn rerun_skips_existing_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let options = write_fixtures(dir.path());
        run(&options).unwrap();

        let paths = DatabasePaths::new(options.database.clone());
        let marker = paths.subject_file("subjA", "dwi/extra.txt");
        fs::write(&marker, "local edit").unwrap();

        let summary = run(&options).unwrap();
        assert_eq!(summary.skipped, vec!["subjA", "subjB"]);
        assert!(marker.is_file());

        let forced = OrganizeOptions {
            force: true,
            ..options
        };
        let summary = run(&forced).unwrap();
        assert_eq!(summary.organized, vec!["subjA", "subjB"]);
        assert!(!marker.exists());
    }

    #[test]
    fn missing_source_file_names_subject_and_rule() {
        let dir = tempfile::tempdir().unwrap();
        let options = write_fixtures(dir.path());
        fs::remove_file(
            options
                .source_root
                .join("subjB/t1/t1_warped.nii.gz"),
        )
        .unwrap();

        let err = run(&options).unwrap_err().to_string();
        assert!(err.contains("subjB"));
        assert!(err.contains("t1_warped.nii.gz"));

        // Nothing half-written for the failing subject.
        let paths = DatabasePaths::new(options.database.clone());
        assert!(!paths.subject_dir("subjB").exists());
    }
}
