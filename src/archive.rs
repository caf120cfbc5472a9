//! HDF5 archive schema.
//!
//! Layout (version 2):
//!   /                       attrs: version, created_at_epoch_ms,
//!                           training_subjs, validation_subjs, space,
//!                           step_size (only when resampling was requested)
//!   /<subject>/<group>      volume groups: `data` dataset plus type,
//!                           affine, voxres and nb_features attrs
//!                           streamline groups: data/offsets/lengths/
//!                           euclidean_lengths datasets plus type and the
//!                           source tractogram's space attrs
use anyhow::{anyhow, Context, Result};
use hdf5::types::VarLenUnicode;
use ndarray::{Array1, Array2, ArrayD};
use std::path::Path;

use crate::streamlines::Tractogram;
use crate::util::now_epoch_ms;

pub const ARCHIVE_VERSION: u32 = 2;

/// Coordinate space the prepared data is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Space {
    Rasmm,
    Vox,
    Voxmm,
}

impl Space {
    pub fn as_str(self) -> &'static str {
        match self {
            Space::Rasmm => "rasmm",
            Space::Vox => "vox",
            Space::Voxmm => "voxmm",
        }
    }
}

/// Root metadata written once per archive.
#[derive(Debug, Clone)]
pub struct ArchiveMeta {
    pub training_subjects: Vec<String>,
    pub validation_subjects: Vec<String>,
    pub step_size_mm: Option<f32>,
    pub space: Space,
}

/// Write-side handle over a new archive file.
pub struct ArchiveWriter {
    file: hdf5::File,
}

impl ArchiveWriter {
    /// Create the archive file and write its root attributes.
    pub fn create(path: &Path, meta: &ArchiveMeta) -> Result<Self> {
        let file = hdf5::File::create(path)
            .with_context(|| format!("create archive {}", path.display()))?;

        file.new_attr::<u32>()
            .create("version")?
            .write_scalar(&ARCHIVE_VERSION)?;
        file.new_attr::<u64>()
            .create("created_at_epoch_ms")?
            .write_scalar(&now_epoch_ms()?)?;
        write_string_list_attr(&file, "training_subjs", &meta.training_subjects)?;
        write_string_list_attr(&file, "validation_subjs", &meta.validation_subjects)?;
        write_string_attr(&file, "space", meta.space.as_str())?;
        if let Some(step) = meta.step_size_mm {
            file.new_attr::<f32>()
                .create("step_size")?
                .write_scalar(&step)?;
        }

        Ok(Self { file })
    }

    pub fn add_subject(&self, subject: &str) -> Result<hdf5::Group> {
        self.file
            .create_group(subject)
            .with_context(|| format!("create archive group for subject {subject:?}"))
    }

    pub fn write_volume_group(
        &self,
        subject_group: &hdf5::Group,
        name: &str,
        data: &ArrayD<f32>,
        affine: &[[f32; 4]; 4],
        voxres: &[f32; 3],
    ) -> Result<()> {
        let group = subject_group
            .create_group(name)
            .with_context(|| format!("create volume group {name:?}"))?;
        write_string_attr(&group, "type", "volume")?;

        let affine_flat: Vec<f32> = affine.iter().flatten().copied().collect();
        let affine = Array2::from_shape_vec((4, 4), affine_flat)?;
        group
            .new_attr::<f32>()
            .shape([4, 4])
            .create("affine")?
            .write(&affine)?;
        group
            .new_attr::<f32>()
            .shape([3])
            .create("voxres")?
            .write(&Array1::from(voxres.to_vec()))?;

        let nb_features = *data.shape().last().unwrap_or(&0) as u32;
        group
            .new_attr::<u32>()
            .create("nb_features")?
            .write_scalar(&nb_features)?;

        let data = data.as_standard_layout();
        group
            .new_dataset_builder()
            .with_data(data.view())
            .create("data")
            .with_context(|| format!("write volume data for group {name:?}"))?;
        Ok(())
    }

    pub fn write_streamlines_group(
        &self,
        subject_group: &hdf5::Group,
        name: &str,
        tractogram: &Tractogram,
    ) -> Result<()> {
        let group = subject_group
            .create_group(name)
            .with_context(|| format!("create streamlines group {name:?}"))?;
        write_string_attr(&group, "type", "streamlines")?;

        let space = &tractogram.space;
        let affine_flat: Vec<f32> = space.affine_to_rasmm.iter().flatten().copied().collect();
        group
            .new_attr::<f32>()
            .shape([4, 4])
            .create("affine")?
            .write(&Array2::from_shape_vec((4, 4), affine_flat)?)?;
        group
            .new_attr::<i16>()
            .shape([3])
            .create("dimensions")?
            .write(&Array1::from(space.dimensions.to_vec()))?;
        group
            .new_attr::<f32>()
            .shape([3])
            .create("voxel_sizes")?
            .write(&Array1::from(space.voxel_sizes.to_vec()))?;
        write_string_attr(&group, "voxel_order", &space.voxel_order)?;

        let flat = &tractogram.streamlines;
        let points: Vec<f32> = flat.data.iter().flatten().copied().collect();
        let points = Array2::from_shape_vec((flat.data.len(), 3), points)?;
        group
            .new_dataset_builder()
            .with_data(&points)
            .create("data")
            .with_context(|| format!("write streamline points for group {name:?}"))?;
        group
            .new_dataset_builder()
            .with_data(&Array1::from(flat.offsets.clone()))
            .create("offsets")?;
        group
            .new_dataset_builder()
            .with_data(&Array1::from(flat.lengths.clone()))
            .create("lengths")?;
        group
            .new_dataset_builder()
            .with_data(&Array1::from(flat.euclidean_lengths.clone()))
            .create("euclidean_lengths")?;
        Ok(())
    }
}

/// Read-side handle used by the check stage and the sampler.
pub struct ArchiveReader {
    file: hdf5::File,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = hdf5::File::open(path)
            .with_context(|| format!("open archive {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn version(&self) -> Result<u32> {
        Ok(self.file.attr("version")?.read_scalar::<u32>()?)
    }

    pub fn space(&self) -> Result<String> {
        read_string_attr(&self.file, "space")
    }

    pub fn step_size_mm(&self) -> Result<Option<f32>> {
        if self.file.attr_names()?.iter().any(|name| name == "step_size") {
            Ok(Some(self.file.attr("step_size")?.read_scalar::<f32>()?))
        } else {
            Ok(None)
        }
    }

    pub fn training_subjects(&self) -> Result<Vec<String>> {
        read_string_list_attr(&self.file, "training_subjs")
    }

    pub fn validation_subjects(&self) -> Result<Vec<String>> {
        read_string_list_attr(&self.file, "validation_subjs")
    }

    /// Subject groups present in the archive, sorted.
    pub fn subjects(&self) -> Result<Vec<String>> {
        let mut names = self.file.member_names()?;
        names.sort();
        Ok(names)
    }

    pub fn subject(&self, subject: &str) -> Result<hdf5::Group> {
        self.file
            .group(subject)
            .with_context(|| format!("archive has no subject {subject:?}"))
    }
}

/// Kind and shape summary of one archive group, as seen by `check`.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupData {
    Volume { shape: Vec<usize>, nb_features: u32 },
    Streamlines { nb_streamlines: usize, nb_points: usize },
}

/// Inspect one group of one subject.
pub fn describe_group(subject_group: &hdf5::Group, name: &str) -> Result<GroupData> {
    let group = subject_group
        .group(name)
        .with_context(|| format!("subject has no group {name:?}"))?;
    let kind = read_string_attr(&group, "type")?;
    match kind.as_str() {
        "volume" => {
            let data = group.dataset("data")?;
            let nb_features = group.attr("nb_features")?.read_scalar::<u32>()?;
            Ok(GroupData::Volume {
                shape: data.shape(),
                nb_features,
            })
        }
        "streamlines" => {
            let lengths = group.dataset("lengths")?;
            let data = group.dataset("data")?;
            Ok(GroupData::Streamlines {
                nb_streamlines: lengths.shape()[0],
                nb_points: data.shape()[0],
            })
        }
        other => Err(anyhow!("group {name:?} has unknown type tag {other:?}")),
    }
}

/// Read a streamlines group back into memory.
pub fn read_streamlines(
    subject_group: &hdf5::Group,
    name: &str,
) -> Result<crate::streamlines::FlatStreamlines> {
    let group = subject_group
        .group(name)
        .with_context(|| format!("subject has no group {name:?}"))?;
    let points = group.dataset("data")?.read_raw::<f32>()?;
    let data = points
        .chunks_exact(3)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect();
    Ok(crate::streamlines::FlatStreamlines {
        data,
        offsets: group.dataset("offsets")?.read_raw::<i64>()?,
        lengths: group.dataset("lengths")?.read_raw::<i64>()?,
        euclidean_lengths: group.dataset("euclidean_lengths")?.read_raw::<f32>()?,
    })
}

fn write_string_attr(container: &hdf5::Location, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|err| anyhow!("attribute {name:?}: {err}"))?;
    container
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn write_string_list_attr(
    container: &hdf5::Location,
    name: &str,
    values: &[String],
) -> Result<()> {
    let values: Vec<VarLenUnicode> = values
        .iter()
        .map(|value| {
            value
                .parse()
                .map_err(|err| anyhow!("attribute {name:?}: {err}"))
        })
        .collect::<Result<_>>()?;
    container
        .new_attr::<VarLenUnicode>()
        .shape([values.len()])
        .create(name)?
        .write(&Array1::from(values))?;
    Ok(())
}

fn read_string_attr(container: &hdf5::Location, name: &str) -> Result<String> {
    let value = container.attr(name)?.read_scalar::<VarLenUnicode>()?;
    Ok(value.as_str().to_string())
}

fn read_string_list_attr(
    container: &hdf5::Location,
    name: &str,
) -> Result<Vec<String>> {
    let values = container.attr(name)?.read_raw::<VarLenUnicode>()?;
    Ok(values.iter().map(|value| value.as_str().to_string()).collect())
}
