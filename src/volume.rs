//! NIfTI volume loading and per-group processing.
//!
//! Every file of a volume group is loaded as a 4-D array (3-D inputs get a
//! trailing feature axis) and must agree with the group's first file on
//! affine and voxel resolution before concatenation. Agreement is a minimal
//! sanity check, not a registration guarantee.
use anyhow::{anyhow, Context, Result};
use ndarray::{ArrayD, Axis};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

use crate::config::Standardization;
use crate::util::allclose;

/// Tolerance when comparing affines across files of a group. Tighter
/// defaults have rejected validly co-registered data in practice.
pub const AFFINE_ATOL: f32 = 1e-5;

/// A loaded 4-D volume with its spatial metadata.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: ArrayD<f32>,
    pub affine: [[f32; 4]; 4],
    pub voxres: [f32; 3],
}

/// Load a NIfTI file as a 4-D float volume.
pub fn load_volume_4d(path: &Path) -> Result<Volume> {
    let object = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("read NIfTI {}", path.display()))?;
    let header = object.header().clone();
    let affine = affine_from_header(&header);
    let voxres = [header.pixdim[1], header.pixdim[2], header.pixdim[3]];
    let data = object
        .into_volume()
        .into_ndarray::<f32>()
        .with_context(|| format!("decode NIfTI {}", path.display()))?;
    let data = to_4d(data, path)?;
    Ok(Volume {
        data,
        affine,
        voxres,
    })
}

/// Load a binary mask (non-zero voxels) from a NIfTI file.
pub fn load_mask(path: &Path) -> Result<ArrayD<bool>> {
    let volume = load_volume_4d(path)?;
    // A mask is spatial; collapse the feature axis it gained in to_4d.
    let spatial = volume
        .data
        .index_axis(Axis(volume.data.ndim() - 1), 0)
        .to_owned();
    Ok(spatial.mapv(|value| value > 0.0))
}

/// Union of several masks, loaded and combined voxel-wise.
pub fn load_combined_mask(paths: &[std::path::PathBuf]) -> Result<Option<ArrayD<bool>>> {
    let mut combined: Option<ArrayD<bool>> = None;
    for path in paths {
        let mask = load_mask(path)?;
        combined = Some(match combined {
            None => mask,
            Some(current) => {
                if current.shape() != mask.shape() {
                    return Err(anyhow!(
                        "standardization mask {} has shape {:?}, expected {:?}",
                        path.display(),
                        mask.shape(),
                        current.shape()
                    ));
                }
                let mut merged = current;
                merged.zip_mut_with(&mask, |a, &b| *a = *a || b);
                merged
            }
        });
    }
    Ok(combined)
}

/// Check a file against its group's reference affine and resolution.
pub fn check_compatible(
    file: &Path,
    group: &str,
    volume: &Volume,
    group_affine: &[[f32; 4]; 4],
    group_res: &[f32; 3],
) -> Result<()> {
    let flat: Vec<f32> = volume.affine.iter().flatten().copied().collect();
    let group_flat: Vec<f32> = group_affine.iter().flatten().copied().collect();
    if !allclose(&flat, &group_flat, AFFINE_ATOL) {
        return Err(anyhow!(
            "file {} does not have the same affine as other files in group {group:?}; \
             group data is concatenated and must share affine and voxel resolution",
            file.display()
        ));
    }
    if !allclose(&volume.voxres, group_res, AFFINE_ATOL) {
        return Err(anyhow!(
            "file {} does not have the same voxel resolution as other files in group {group:?} \
             (got {:?}, expected {:?})",
            file.display(),
            volume.voxres,
            group_res
        ));
    }
    Ok(())
}

/// Concatenate volumes channels-last, in the given order.
pub fn concat_channels(group: &str, volumes: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
    let views: Vec<_> = volumes.iter().map(|volume| volume.view()).collect();
    let last = views
        .first()
        .map(|view| view.ndim() - 1)
        .ok_or_else(|| anyhow!("group {group:?} produced no volumes"))?;
    ndarray::concatenate(Axis(last), &views)
        .map_err(|err| anyhow!("group {group:?}: could not concatenate volumes: {err}"))
}

/// Z-score standardization over the masked voxels (all non-zero voxels if
/// no mask is given). `independent` standardizes each feature channel
/// separately.
pub fn standardize(data: &mut ArrayD<f32>, mask: Option<&ArrayD<bool>>, independent: bool) {
    let channel_axis = Axis(data.ndim() - 1);
    if independent {
        for mut channel in data.axis_iter_mut(channel_axis) {
            standardize_slice(channel.iter_mut(), mask);
        }
    } else {
        let channels = data.len_of(channel_axis);
        // The mask covers the spatial dims; repeat it across channels.
        let mut values: Vec<&mut f32> = Vec::new();
        for value in data.iter_mut() {
            values.push(value);
        }
        match mask {
            Some(mask) => {
                let selected = values
                    .into_iter()
                    .zip(mask.iter().flat_map(|&keep| std::iter::repeat(keep).take(channels)))
                    .filter_map(|(value, keep)| keep.then_some(value));
                apply_zscore(selected);
            }
            None => apply_zscore(values.into_iter()),
        }
    }
}

/// Apply the configured standardization mode at the whole-group step.
pub fn standardize_group(
    data: &mut ArrayD<f32>,
    mask: Option<&ArrayD<bool>>,
    mode: Standardization,
) {
    match mode {
        Standardization::Independent => standardize(data, mask, true),
        Standardization::All => standardize(data, mask, false),
        // per_file is applied before concatenation; none leaves data as-is.
        Standardization::PerFile | Standardization::None => {}
    }
}

fn standardize_slice<'a, I>(values: I, mask: Option<&ArrayD<bool>>)
where
    I: Iterator<Item = &'a mut f32>,
{
    match mask {
        Some(mask) => {
            let selected = values
                .zip(mask.iter())
                .filter_map(|(value, &keep)| keep.then_some(value));
            apply_zscore(selected);
        }
        None => apply_zscore(values),
    }
}

fn apply_zscore<'a, I>(values: I)
where
    I: Iterator<Item = &'a mut f32>,
{
    let mut selected: Vec<&mut f32> = values.collect();
    let n = selected.len() as f32;
    if n == 0.0 {
        return;
    }
    let mean = selected.iter().map(|value| **value).sum::<f32>() / n;
    let var = selected
        .iter()
        .map(|value| (**value - mean).powi(2))
        .sum::<f32>()
        / n;
    let std = var.sqrt();
    if std == 0.0 {
        return;
    }
    for value in selected.iter_mut() {
        **value = (**value - mean) / std;
    }
}

fn to_4d(data: ArrayD<f32>, path: &Path) -> Result<ArrayD<f32>> {
    match data.ndim() {
        3 => Ok(data.insert_axis(Axis(3))),
        4 => Ok(data),
        other => Err(anyhow!(
            "{} has {other} dimensions; expected a 3-D or 4-D volume",
            path.display()
        )),
    }
}

fn affine_from_header(header: &NiftiHeader) -> [[f32; 4]; 4] {
    if header.sform_code > 0 {
        [
            header.srow_x,
            header.srow_y,
            header.srow_z,
            [0.0, 0.0, 0.0, 1.0],
        ]
    } else {
        // Fallback: scaling-only affine from voxel dimensions.
        let [dx, dy, dz] = [header.pixdim[1], header.pixdim[2], header.pixdim[3]];
        [
            [dx, 0.0, 0.0, 0.0],
            [0.0, dy, 0.0, 0.0],
            [0.0, 0.0, dz, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}
