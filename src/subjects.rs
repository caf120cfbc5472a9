//! Subject list files and the training/validation split.
//!
//! A subject list is plain text, one identifier per line; blank lines and
//! `#` comments are ignored. Lists must be duplicate-free and the two sides
//! of the split must be disjoint so the archive holds exactly their union.
use crate::layout::DatabasePaths;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Training/validation partition of the subjects to package.
#[derive(Debug, Clone)]
pub struct SubjectSplit {
    pub training: Vec<String>,
    pub validation: Vec<String>,
}

impl SubjectSplit {
    /// Load both list files and validate the split.
    pub fn load(training_path: &Path, validation_path: &Path) -> Result<Self> {
        let training = read_subject_list(training_path)?;
        let validation = read_subject_list(validation_path)?;

        let overlap: Vec<&String> = training
            .iter()
            .filter(|subject| validation.contains(subject))
            .collect();
        if !overlap.is_empty() {
            return Err(anyhow!(
                "subjects listed in both training and validation sets: {}",
                overlap
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        Ok(Self {
            training,
            validation,
        })
    }

    /// All subjects in list order, training first.
    pub fn union(&self) -> Vec<String> {
        let mut all = self.training.clone();
        all.extend(self.validation.iter().cloned());
        all
    }
}

/// Read one subject list file.
pub fn read_subject_list(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read subject list {}", path.display()))?;

    let mut subjects = Vec::new();
    let mut seen = BTreeSet::new();
    for (line_idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains(char::is_whitespace) || line.contains('/') {
            return Err(anyhow!(
                "invalid subject id {:?} at {}:{}",
                line,
                path.display(),
                line_idx + 1
            ));
        }
        if !seen.insert(line.to_string()) {
            return Err(anyhow!(
                "duplicate subject {:?} in {}",
                line,
                path.display()
            ));
        }
        subjects.push(line.to_string());
    }

    if subjects.is_empty() {
        return Err(anyhow!("subject list {} is empty", path.display()));
    }
    Ok(subjects)
}

/// Verify every listed subject has a standardized directory.
///
/// Packaging must fail fast here, before any data is read, rather than
/// skipping subjects silently.
pub fn verify_subjects_exist(paths: &DatabasePaths, subjects: &[String]) -> Result<()> {
    let ready = paths.ready_dir();
    if !ready.is_dir() {
        return Err(anyhow!(
            "no standardized data found: {} does not exist",
            ready.display()
        ));
    }

    let missing: Vec<&String> = subjects
        .iter()
        .filter(|subject| !paths.subject_dir(subject).is_dir())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "subjects not found under {}: {}",
            ready.display(),
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    Ok(())
}
