//! Shared fixture builders for integration tests.
use ndarray::Array3;
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use std::fs;
use std::path::Path;

/// Write a small 3-D NIfTI volume filled with `value`, 2 mm isotropic.
pub fn write_nifti_volume(path: &Path, shape: (usize, usize, usize), value: f32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let data = Array3::<f32>::from_elem(shape, value);
    let header = NiftiHeader {
        pixdim: [1.0, 2.0, 2.0, 2.0, 1.0, 1.0, 1.0, 1.0],
        sform_code: 0,
        qform_code: 0,
        ..NiftiHeader::default()
    };
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&data)
        .unwrap();
}

/// Write a minimal little-endian TrackVis file.
pub fn write_trk(path: &Path, streamlines: &[Vec<[f32; 3]>]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut bytes = vec![0u8; 1000];
    bytes[..5].copy_from_slice(b"TRACK");
    for (index, dim) in [10i16, 10, 10].iter().enumerate() {
        bytes[6 + index * 2..8 + index * 2].copy_from_slice(&dim.to_le_bytes());
    }
    for (index, size) in [2.0f32, 2.0, 2.0].iter().enumerate() {
        bytes[12 + index * 4..16 + index * 4].copy_from_slice(&size.to_le_bytes());
    }
    for row in 0..4 {
        bytes[440 + (row * 4 + row) * 4..444 + (row * 4 + row) * 4]
            .copy_from_slice(&1.0f32.to_le_bytes());
    }
    bytes[948..951].copy_from_slice(b"RAS");
    bytes[988..992].copy_from_slice(&(streamlines.len() as i32).to_le_bytes());
    bytes[992..996].copy_from_slice(&2i32.to_le_bytes());
    bytes[996..1000].copy_from_slice(&1000i32.to_le_bytes());

    for streamline in streamlines {
        bytes.extend_from_slice(&(streamline.len() as i32).to_le_bytes());
        for point in streamline {
            for value in point {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    fs::write(path, bytes).unwrap();
}
