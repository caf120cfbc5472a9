//! Archive validation.
//!
//! Collects every problem instead of stopping at the first, so one run
//! reports everything wrong with an archive. The caller turns a non-empty
//! failure list into a non-zero exit.
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::archive::{describe_group, read_streamlines, ArchiveReader, GroupData, ARCHIVE_VERSION};
use crate::config::{self, GroupKind};
use crate::sampler::{BatchSampler, SamplerConfig, SubjectStreamlines};
use crate::subjects::SubjectSplit;

/// Inputs for the check stage.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub archive: PathBuf,
    pub config_file: PathBuf,
    pub training_subjects_file: PathBuf,
    pub validation_subjects_file: PathBuf,
    pub sampler: SamplerConfig,
}

/// Everything one check run found.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub failures: Vec<String>,
    pub subjects_checked: usize,
    pub batches_sampled: usize,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, message: String) {
        tracing::warn!("{message}");
        self.failures.push(message);
    }
}

/// Validate an archive against its configuration and subject lists.
pub fn run(options: &CheckOptions) -> Result<CheckReport> {
    let split = SubjectSplit::load(
        &options.training_subjects_file,
        &options.validation_subjects_file,
    )?;
    let groups = config::load_groups_config(&options.config_file)?;
    let reader = ArchiveReader::open(&options.archive)?;

    let mut report = CheckReport::default();
    check_root(&reader, &split, &mut report)?;

    let mut expected = split.union();
    expected.sort();
    let actual = reader.subjects()?;
    for subject in &expected {
        if !actual.contains(subject) {
            report.fail(format!("archive is missing subject {subject:?}"));
        }
    }
    for subject in &actual {
        if !expected.contains(subject) {
            report.fail(format!("archive holds unlisted subject {subject:?}"));
        }
    }

    let streamline_groups: Vec<String> = config::groups_of_kind(&groups, GroupKind::Streamlines)
        .iter()
        .map(|(name, _)| (*name).clone())
        .collect();
    let mut sampleable: BTreeMap<String, Vec<SubjectStreamlines>> = BTreeMap::new();
    for subject in actual.iter().filter(|subject| expected.contains(subject)) {
        let subject_group = reader.subject(subject)?;
        report.subjects_checked += 1;
        for (group, spec) in &groups {
            check_group(subject, &subject_group, group, spec.kind, &mut report);
        }
        for group in &streamline_groups {
            if let Ok(flat) = read_streamlines(&subject_group, group) {
                sampleable.entry(group.clone()).or_default().push(
                    SubjectStreamlines {
                        subject: subject.clone(),
                        euclidean_lengths: flat.euclidean_lengths,
                    },
                );
            }
        }
    }

    for (group, subjects) in sampleable {
        sampling_smoke(&group, subjects, options.sampler.clone(), &mut report)?;
    }
    Ok(report)
}

fn check_root(reader: &ArchiveReader, split: &SubjectSplit, report: &mut CheckReport) -> Result<()> {
    let version = reader.version().context("archive has no version attribute")?;
    if version != ARCHIVE_VERSION {
        report.fail(format!(
            "archive version is {version}, expected {ARCHIVE_VERSION}"
        ));
    }
    match reader.space()?.as_str() {
        "rasmm" | "vox" | "voxmm" => {}
        other => report.fail(format!("unknown space tag {other:?}")),
    }
    if let Some(step) = reader.step_size_mm()? {
        if step <= 0.0 {
            report.fail(format!("step_size attribute is not positive: {step}"));
        }
    }
    if reader.training_subjects()? != split.training {
        report.fail("training_subjs attribute does not match the training list".to_string());
    }
    if reader.validation_subjects()? != split.validation {
        report.fail("validation_subjs attribute does not match the validation list".to_string());
    }
    Ok(())
}

fn check_group(
    subject: &str,
    subject_group: &hdf5::Group,
    group: &str,
    expected: GroupKind,
    report: &mut CheckReport,
) {
    let described = match describe_group(subject_group, group) {
        Ok(described) => described,
        Err(err) => {
            report.fail(format!("subject {subject:?}, group {group:?}: {err:#}"));
            return;
        }
    };
    match (expected, described) {
        (GroupKind::Volume, GroupData::Volume { shape, nb_features }) => {
            if shape.len() != 4 {
                report.fail(format!(
                    "subject {subject:?}, group {group:?}: volume data has shape {shape:?}, \
                     expected 4 dimensions"
                ));
            } else if shape[3] != nb_features as usize {
                report.fail(format!(
                    "subject {subject:?}, group {group:?}: nb_features is {nb_features} but \
                     data has {} channels",
                    shape[3]
                ));
            }
        }
        (GroupKind::Streamlines, GroupData::Streamlines { .. }) => {
            check_streamline_layout(subject, subject_group, group, report);
        }
        (expected, described) => {
            report.fail(format!(
                "subject {subject:?}, group {group:?}: configured as {expected:?} but archive \
                 holds {described:?}"
            ));
        }
    }
}

fn check_streamline_layout(
    subject: &str,
    subject_group: &hdf5::Group,
    group: &str,
    report: &mut CheckReport,
) {
    let flat = match read_streamlines(subject_group, group) {
        Ok(flat) => flat,
        Err(err) => {
            report.fail(format!("subject {subject:?}, group {group:?}: {err:#}"));
            return;
        }
    };
    let nb_points = flat.data.len() as i64;
    if flat.offsets.len() != flat.lengths.len()
        || flat.offsets.len() != flat.euclidean_lengths.len()
    {
        report.fail(format!(
            "subject {subject:?}, group {group:?}: offsets, lengths and euclidean_lengths \
             disagree on the streamline count"
        ));
        return;
    }
    let mut expected_offset = 0i64;
    for (index, (&offset, &length)) in flat.offsets.iter().zip(&flat.lengths).enumerate() {
        if offset != expected_offset || length < 2 || offset + length > nb_points {
            report.fail(format!(
                "subject {subject:?}, group {group:?}: streamline {index} has inconsistent \
                 offset/length ({offset}/{length} over {nb_points} points)"
            ));
            return;
        }
        expected_offset += length;
    }
    if expected_offset != nb_points {
        report.fail(format!(
            "subject {subject:?}, group {group:?}: {} points are not covered by any streamline",
            nb_points - expected_offset
        ));
    }
}

/// Draw one full epoch over one streamline group and assert it visits
/// every streamline once.
fn sampling_smoke(
    group: &str,
    subjects: Vec<SubjectStreamlines>,
    config: SamplerConfig,
    report: &mut CheckReport,
) -> Result<()> {
    let total: usize = subjects
        .iter()
        .map(|subject| subject.euclidean_lengths.len())
        .sum();
    let mut sampler = BatchSampler::new(subjects, config)?;
    let mut drawn = 0usize;
    for batch in sampler.epoch() {
        report.batches_sampled += 1;
        drawn += batch.iter().map(|part| part.indices.len()).sum::<usize>();
    }
    if drawn != total {
        report.fail(format!(
            "group {group:?}: sampling smoke test drew {drawn} of {total} streamlines \
             in one epoch"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Space;
    use crate::layout::DatabasePaths;
    use crate::package::{self, PackageOptions};
    use std::fs;
    use std::path::Path;

    fn packaged_fixture(dir: &Path) -> CheckOptions {
        let train = dir.join("train.txt");
        fs::write(&train, "subjA\n").unwrap();
        let valid = dir.join("valid.txt");
        fs::write(&valid, "subjB\n").unwrap();
        let config_file = dir.join("groups.json");
        fs::write(
            &config_file,
            r#"{"streamlines": {"type": "streamlines", "files": ["bundles/af.trk"]}}"#,
        )
        .unwrap();

        let paths = DatabasePaths::new(dir.join("db"));
        for subject in ["subjA", "subjB"] {
            let bundles = paths.subject_dir(subject).join("bundles");
            fs::create_dir_all(&bundles).unwrap();
            crate::streamlines::write_trk(
                &bundles.join("af.trk"),
                &[
                    vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
                    vec![[0.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 4.0, 0.0]],
                ],
            );
        }

        let summary = package::run(&PackageOptions {
            database: dir.join("db"),
            config_file: config_file.clone(),
            training_subjects_file: train.clone(),
            validation_subjects_file: valid.clone(),
            name: None,
            std_masks: Vec::new(),
            space: Space::Rasmm,
            step_size_mm: None,
            enforce_files_presence: true,
            save_intermediate: false,
            force: false,
        })
        .unwrap();

        CheckOptions {
            archive: summary.archive,
            config_file,
            training_subjects_file: train,
            validation_subjects_file: valid,
            sampler: SamplerConfig {
                batch_size: 2.0,
                chunk_size: 1,
                ..SamplerConfig::default()
            },
        }
    }

    #[test]
    fn fresh_archive_passes_all_checks() {
        let dir = tempfile::tempdir().unwrap();
        let options = packaged_fixture(dir.path());
        let report = run(&options).unwrap();
        assert!(report.ok(), "unexpected failures: {:?}", report.failures);
        assert_eq!(report.subjects_checked, 2);
        assert!(report.batches_sampled >= 1);
    }

    #[test]
    fn every_streamline_group_feeds_the_sampling_pass() {
        let dir = tempfile::tempdir().unwrap();
        let train = dir.path().join("train.txt");
        fs::write(&train, "subjA\n").unwrap();
        let valid = dir.path().join("valid.txt");
        fs::write(&valid, "subjB\n").unwrap();
        let config_file = dir.path().join("groups.json");
        fs::write(
            &config_file,
            r#"{
                "af": {"type": "streamlines", "files": ["bundles/af.trk"]},
                "cst": {"type": "streamlines", "files": ["bundles/cst.trk"]}
            }"#,
        )
        .unwrap();

        let paths = DatabasePaths::new(dir.path().join("db"));
        for subject in ["subjA", "subjB"] {
            let bundles = paths.subject_dir(subject).join("bundles");
            fs::create_dir_all(&bundles).unwrap();
            for bundle in ["af.trk", "cst.trk"] {
                crate::streamlines::write_trk(
                    &bundles.join(bundle),
                    &[vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]],
                );
            }
        }

        let summary = package::run(&PackageOptions {
            database: dir.path().join("db"),
            config_file: config_file.clone(),
            training_subjects_file: train.clone(),
            validation_subjects_file: valid.clone(),
            name: None,
            std_masks: Vec::new(),
            space: Space::Rasmm,
            step_size_mm: None,
            enforce_files_presence: true,
            save_intermediate: false,
            force: false,
        })
        .unwrap();

        let report = run(&CheckOptions {
            archive: summary.archive,
            config_file,
            training_subjects_file: train,
            validation_subjects_file: valid,
            sampler: SamplerConfig {
                batch_size: 1.0,
                chunk_size: 1,
                ..SamplerConfig::default()
            },
        })
        .unwrap();
        assert!(report.ok(), "unexpected failures: {:?}", report.failures);
        // One epoch per group; both groups must contribute batches.
        assert!(report.batches_sampled >= 2);
    }

    #[test]
    fn list_drift_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = packaged_fixture(dir.path());
        // The archive was built before subjC joined the training list.
        fs::write(&options.training_subjects_file, "subjA\nsubjC\n").unwrap();

        let report = run(&options).unwrap();
        assert!(!report.ok());
        assert!(report
            .failures
            .iter()
            .any(|failure| failure.contains("subjC")));
    }

    #[test]
    fn unconfigured_group_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = packaged_fixture(dir.path());
        // The config now expects a group the archive never got.
        fs::write(
            &options.config_file,
            r#"{
                "streamlines": {"type": "streamlines", "files": ["bundles/af.trk"]},
                "input": {"type": "volume", "standardization": "none",
                          "files": ["dwi/dwi.nii.gz"]}
            }"#,
        )
        .unwrap();

        let report = run(&options).unwrap();
        assert!(report
            .failures
            .iter()
            .any(|failure| failure.contains("input")));
    }
}
