//! Packaging: standardized tree -> one HDF5 archive.
//!
//! The archive is built in a temporary sibling file and renamed over the
//! final name only once complete, so a failed run never leaves a truncated
//! archive and `--force` replaces rather than merges.
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveMeta, ArchiveWriter, Space};
use crate::config::{self, GroupKind, GroupSpec, GroupsConfig, Standardization};
use crate::layout::{expand_for_subject, DatabasePaths};
use crate::staging::{publish_file, tmp_sibling};
use crate::streamlines::{self, Tractogram};
use crate::subjects::{verify_subjects_exist, SubjectSplit};
use crate::util::now_epoch_ms;
use crate::volume::{self, Volume};

pub const DEFAULT_ARCHIVE_NAME: &str = "dataset.hdf5";

/// Inputs for the packaging stage.
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub database: PathBuf,
    pub config_file: PathBuf,
    pub training_subjects_file: PathBuf,
    pub validation_subjects_file: PathBuf,
    pub name: Option<String>,
    pub std_masks: Vec<String>,
    pub space: Space,
    pub step_size_mm: Option<f32>,
    pub enforce_files_presence: bool,
    pub save_intermediate: bool,
    pub force: bool,
}

/// What a completed packaging run produced.
#[derive(Debug)]
pub struct PackageSummary {
    pub archive: PathBuf,
    pub subjects: Vec<String>,
    pub groups: Vec<String>,
}

/// Build the archive.
pub fn run(options: &PackageOptions) -> Result<PackageSummary> {
    if let Some(step) = options.step_size_mm {
        if step <= 0.0 {
            bail!("--step-size must be positive, got {step}");
        }
    }

    let split = SubjectSplit::load(
        &options.training_subjects_file,
        &options.validation_subjects_file,
    )?;
    let subjects = split.union();
    let paths = DatabasePaths::new(options.database.clone());
    verify_subjects_exist(&paths, &subjects)?;

    let groups = config::load_groups_config(&options.config_file)?;
    let present = preflight_files(&paths, &subjects, &groups, options)?;

    let archive_path = paths.root().join(archive_file_name(options.name.as_deref()));
    if archive_path.exists() && !options.force {
        bail!(
            "archive {} already exists (use --force to replace it)",
            archive_path.display()
        );
    }

    let intermediate_dir = if options.save_intermediate {
        let dir = paths
            .root()
            .join(format!("intermediate_{}", now_epoch_ms()?));
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Some(dir)
    } else {
        None
    };

    let tmp = tmp_sibling(&archive_path)?;
    let result = build_archive(
        &tmp,
        &paths,
        &split,
        &subjects,
        &groups,
        &present,
        options,
        intermediate_dir.as_deref(),
    );
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    publish_file(&tmp, &archive_path)?;
    tracing::info!(archive = %archive_path.display(), "archive written");

    Ok(PackageSummary {
        archive: archive_path,
        subjects,
        groups: groups.keys().cloned().collect(),
    })
}

/// Per subject, the configured files that actually exist.
type PresentFiles = std::collections::BTreeMap<(String, String), Vec<PathBuf>>;

/// Verify every configured file (and std-mask) for every subject.
///
/// With enforcement on, any missing path aborts the run before the archive
/// is opened; all missing paths are reported at once. With enforcement off,
/// missing files are dropped from their group with a warning.
fn preflight_files(
    paths: &DatabasePaths,
    subjects: &[String],
    groups: &GroupsConfig,
    options: &PackageOptions,
) -> Result<PresentFiles> {
    let mut present = PresentFiles::new();
    let mut missing = Vec::new();

    for subject in subjects {
        for (group, spec) in groups {
            let mut files = Vec::new();
            for rel in &spec.files {
                let rel = expand_for_subject(rel, subject);
                let path = paths.subject_file(subject, &rel);
                if path.is_file() {
                    files.push(path);
                } else if options.enforce_files_presence {
                    missing.push(format!("{subject}: {rel}"));
                } else {
                    tracing::warn!(%subject, %group, file = %rel, "missing file skipped");
                }
            }
            present.insert((subject.clone(), group.clone()), files);
        }
        for rel in &options.std_masks {
            let rel = expand_for_subject(rel, subject);
            if !paths.subject_file(subject, &rel).is_file() {
                if options.enforce_files_presence {
                    missing.push(format!("{subject}: {rel} (std-mask)"));
                } else {
                    tracing::warn!(%subject, mask = %rel, "missing std-mask skipped");
                }
            }
        }
    }

    if !missing.is_empty() {
        bail!(
            "missing files for {} entr{}:\n  {}",
            missing.len(),
            if missing.len() == 1 { "y" } else { "ies" },
            missing.join("\n  ")
        );
    }
    Ok(present)
}

#[allow(clippy::too_many_arguments)]
fn build_archive(
    tmp: &Path,
    paths: &DatabasePaths,
    split: &SubjectSplit,
    subjects: &[String],
    groups: &GroupsConfig,
    present: &PresentFiles,
    options: &PackageOptions,
    intermediate_dir: Option<&Path>,
) -> Result<()> {
    let meta = ArchiveMeta {
        training_subjects: split.training.clone(),
        validation_subjects: split.validation.clone(),
        step_size_mm: options.step_size_mm,
        space: options.space,
    };
    let writer = ArchiveWriter::create(tmp, &meta)?;

    for subject in subjects {
        tracing::info!(%subject, "packaging");
        let subject_group = writer.add_subject(subject)?;
        let mask = load_subject_mask(paths, subject, &options.std_masks)?;
        let mut manifest = SubjectManifest::new(subject);

        for (group, spec) in groups {
            let files = present
                .get(&(subject.clone(), group.clone()))
                .map(Vec::as_slice)
                .unwrap_or_default();
            if files.is_empty() {
                tracing::warn!(%subject, %group, "no files present, group skipped");
                continue;
            }
            match spec.kind {
                GroupKind::Volume => {
                    let (data, affine, voxres) =
                        build_volume_group(subject, group, spec, files, mask.as_ref())?;
                    writer.write_volume_group(&subject_group, group, &data, &affine, &voxres)?;
                    manifest.volume(group, files, data.shape());
                }
                GroupKind::Streamlines => {
                    let tractogram = build_streamlines_group(group, files, options.step_size_mm)?;
                    writer.write_streamlines_group(&subject_group, group, &tractogram)?;
                    manifest.streamlines(group, files, tractogram.streamlines.nb_streamlines());
                }
            }
        }

        if let Some(dir) = intermediate_dir {
            manifest.write(dir)?;
        }
    }
    Ok(())
}

fn build_volume_group(
    subject: &str,
    group: &str,
    spec: &GroupSpec,
    files: &[PathBuf],
    mask: Option<&ndarray::ArrayD<bool>>,
) -> Result<(ndarray::ArrayD<f32>, [[f32; 4]; 4], [f32; 3])> {
    let mode = spec.standardization.unwrap_or(Standardization::None);

    let mut volumes: Vec<ndarray::ArrayD<f32>> = Vec::with_capacity(files.len());
    let mut group_affine = None;
    let mut group_res = [0.0f32; 3];
    for file in files {
        let mut loaded: Volume = volume::load_volume_4d(file)?;
        match &group_affine {
            None => {
                group_affine = Some(loaded.affine);
                group_res = loaded.voxres;
            }
            Some(affine) => {
                volume::check_compatible(file, group, &loaded, affine, &group_res)?;
            }
        }
        if let Some(mask) = mask {
            if mask.shape() != &loaded.data.shape()[..loaded.data.ndim() - 1] {
                bail!(
                    "subject {subject}: std-mask shape {:?} does not match volume {} shape {:?}",
                    mask.shape(),
                    file.display(),
                    loaded.data.shape()
                );
            }
        }
        if mode == Standardization::PerFile {
            volume::standardize(&mut loaded.data, mask, false);
        }
        volumes.push(loaded.data);
    }

    let mut data = volume::concat_channels(group, &volumes)?;
    volume::standardize_group(&mut data, mask, mode);
    let affine =
        group_affine.ok_or_else(|| anyhow!("group {group:?} produced no volumes"))?;
    Ok((data, affine, group_res))
}

fn build_streamlines_group(
    group: &str,
    files: &[PathBuf],
    step_size_mm: Option<f32>,
) -> Result<Tractogram> {
    let tractograms = files
        .iter()
        .map(|file| streamlines::load_trk(file, step_size_mm))
        .collect::<Result<Vec<_>>>()?;
    streamlines::merge_tractograms(group, tractograms)
}

fn load_subject_mask(
    paths: &DatabasePaths,
    subject: &str,
    std_masks: &[String],
) -> Result<Option<ndarray::ArrayD<bool>>> {
    let mask_paths: Vec<PathBuf> = std_masks
        .iter()
        .map(|rel| paths.subject_file(subject, &expand_for_subject(rel, subject)))
        .filter(|path| path.is_file())
        .collect();
    volume::load_combined_mask(&mask_paths)
}

fn archive_file_name(name: Option<&str>) -> String {
    match name {
        None => DEFAULT_ARCHIVE_NAME.to_string(),
        Some(name) if name.ends_with(".hdf5") => name.to_string(),
        Some(name) => format!("{name}.hdf5"),
    }
}

/// Per-subject record written by `--save-intermediate`.
#[derive(Debug, Serialize)]
struct SubjectManifest {
    subject: String,
    groups: Vec<GroupManifest>,
}

#[derive(Debug, Serialize)]
struct GroupManifest {
    group: String,
    kind: &'static str,
    files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nb_streamlines: Option<usize>,
}

impl SubjectManifest {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            groups: Vec::new(),
        }
    }

    fn volume(&mut self, group: &str, files: &[PathBuf], shape: &[usize]) {
        self.groups.push(GroupManifest {
            group: group.to_string(),
            kind: "volume",
            files: display_files(files),
            shape: Some(shape.to_vec()),
            nb_streamlines: None,
        });
    }

    fn streamlines(&mut self, group: &str, files: &[PathBuf], nb_streamlines: usize) {
        self.groups.push(GroupManifest {
            group: group.to_string(),
            kind: "streamlines",
            files: display_files(files),
            shape: None,
            nb_streamlines: Some(nb_streamlines),
        });
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(format!("{}.json", self.subject));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

fn display_files(files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|file| file.display().to_string())
        .collect()
}
