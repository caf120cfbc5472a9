//! TrackVis (.trk) streamline loading and preparation.
//!
//! Streamlines are stored decomposed in the archive: one flat `(n, 3)` point
//! block plus per-streamline offsets and lengths. The TRK header also feeds
//! the group's space attributes so a consumer can reconstruct the reference.
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;

const TRK_HEADER_SIZE: usize = 1000;
const TRK_MAGIC: &[u8; 5] = b"TRACK";

/// Spatial reference carried by a TRK file header.
#[derive(Debug, Clone, PartialEq)]
pub struct TrkSpace {
    pub affine_to_rasmm: [[f32; 4]; 4],
    pub dimensions: [i16; 3],
    pub voxel_sizes: [f32; 3],
    pub voxel_order: String,
}

/// Streamlines in decomposed form.
///
/// `data` holds all points as consecutive xyz triplets. Streamline `i`
/// covers rows `offsets[i] .. offsets[i] + lengths[i]`.
#[derive(Debug, Clone, Default)]
pub struct FlatStreamlines {
    pub data: Vec<[f32; 3]>,
    pub offsets: Vec<i64>,
    pub lengths: Vec<i64>,
    pub euclidean_lengths: Vec<f32>,
}

impl FlatStreamlines {
    pub fn nb_streamlines(&self) -> usize {
        self.lengths.len()
    }

    /// Append one streamline's points.
    pub fn push(&mut self, points: &[[f32; 3]]) {
        self.push_with_length(points, arc_length(points));
    }

    /// Append a streamline whose euclidean length was measured before any
    /// resampling changed the polyline.
    pub fn push_with_length(&mut self, points: &[[f32; 3]], euclidean_length: f32) {
        self.offsets.push(self.data.len() as i64);
        self.lengths.push(points.len() as i64);
        self.euclidean_lengths.push(euclidean_length);
        self.data.extend_from_slice(points);
    }

    /// Points of streamline `index`.
    pub fn streamline(&self, index: usize) -> &[[f32; 3]] {
        let start = self.offsets[index] as usize;
        let end = start + self.lengths[index] as usize;
        &self.data[start..end]
    }
}

/// One loaded tractogram: its streamlines plus the header's space.
#[derive(Debug, Clone)]
pub struct Tractogram {
    pub streamlines: FlatStreamlines,
    pub space: TrkSpace,
}

/// Load a TRK file, optionally resampling every streamline to a fixed
/// step size in millimeters.
pub fn load_trk(path: &Path, step_size_mm: Option<f32>) -> Result<Tractogram> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; TRK_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .with_context(|| format!("read TRK header of {}", path.display()))?;
    let space = parse_header(&header, path)?;

    let n_scalars = i16_at(&header, 36);
    let n_properties = i16_at(&header, 238);
    // The TRK format caps both counts at 10; anything outside that range
    // means a corrupt or foreign header, not data worth reading.
    for (field, value) in [("n_scalars", n_scalars), ("n_properties", n_properties)] {
        if !(0..=10).contains(&value) {
            bail!(
                "{}: TRK header field {field} is {value}, expected 0..=10",
                path.display()
            );
        }
    }
    if n_scalars > 0 || n_properties > 0 {
        tracing::warn!(
            file = %path.display(),
            scalars = n_scalars,
            properties = n_properties,
            "per-point scalars and per-streamline properties are dropped"
        );
    }
    let n_scalars = n_scalars as usize;
    let n_properties = n_properties as usize;
    let n_count = i32_at(&header, 988);

    let mut streamlines = FlatStreamlines::default();
    let mut skipped = 0usize;
    let mut points = Vec::new();
    loop {
        let mut count_bytes = [0u8; 4];
        match reader.read_exact(&mut count_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(err).with_context(|| format!("read streamline in {}", path.display()))
            }
        }
        let n_points = i32::from_le_bytes(count_bytes);
        if n_points <= 0 {
            bail!(
                "{}: streamline {} declares {} points",
                path.display(),
                streamlines.nb_streamlines(),
                n_points
            );
        }

        points.clear();
        let floats_per_point = 3 + n_scalars;
        let mut point_bytes = vec![0u8; n_points as usize * floats_per_point * 4];
        reader
            .read_exact(&mut point_bytes)
            .with_context(|| format!("read streamline points in {}", path.display()))?;
        for chunk in point_bytes.chunks_exact(floats_per_point * 4) {
            points.push([
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                f32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]),
            ]);
        }
        // Per-streamline properties are not kept.
        let mut property_bytes = vec![0u8; n_properties * 4];
        reader
            .read_exact(&mut property_bytes)
            .with_context(|| format!("read streamline properties in {}", path.display()))?;

        // A single point is not a polyline; the archive layout and the
        // resampler both assume at least a segment.
        if points.len() < 2 {
            tracing::warn!(file = %path.display(), "dropping single-point streamline");
            skipped += 1;
            continue;
        }

        match step_size_mm {
            Some(step) => {
                let length = arc_length(&points);
                let resampled = resample_step_size(&points, step);
                streamlines.push_with_length(&resampled, length);
            }
            None => streamlines.push(&points),
        }
    }

    if n_count > 0 && streamlines.nb_streamlines() + skipped != n_count as usize {
        bail!(
            "{}: header declares {} streamlines but file holds {}",
            path.display(),
            n_count,
            streamlines.nb_streamlines() + skipped
        );
    }

    Ok(Tractogram { streamlines, space })
}

/// Merge tractograms for one group; all files must share a space.
pub fn merge_tractograms(group: &str, tractograms: Vec<Tractogram>) -> Result<Tractogram> {
    let mut iter = tractograms.into_iter();
    let mut merged = iter
        .next()
        .ok_or_else(|| anyhow!("group {group:?} produced no tractograms"))?;
    for tractogram in iter {
        if tractogram.space != merged.space {
            bail!(
                "group {group:?}: tractograms do not share a spatial reference and cannot be merged"
            );
        }
        for index in 0..tractogram.streamlines.nb_streamlines() {
            merged.streamlines.push_with_length(
                tractogram.streamlines.streamline(index),
                tractogram.streamlines.euclidean_lengths[index],
            );
        }
    }
    Ok(merged)
}

/// Resample a polyline to a uniform step along its arc length.
///
/// Keeps both endpoints; the actual step is `length / (n - 1)` for the
/// largest n whose step does not exceed the requested one, with a floor of
/// two points so degenerate streamlines survive.
pub fn resample_step_size(points: &[[f32; 3]], step_size_mm: f32) -> Vec<[f32; 3]> {
    if points.len() < 2 || step_size_mm <= 0.0 {
        return points.to_vec();
    }
    let total = arc_length(points);
    if total == 0.0 {
        return vec![points[0], points[points.len() - 1]];
    }
    let n = ((total / step_size_mm).floor() as usize + 1).max(2);
    resample_to_n(points, n, total)
}

fn resample_to_n(points: &[[f32; 3]], n: usize, total: f32) -> Vec<[f32; 3]> {
    let mut cumulative = Vec::with_capacity(points.len());
    let mut acc = 0.0f32;
    cumulative.push(0.0);
    for pair in points.windows(2) {
        acc += distance(&pair[0], &pair[1]);
        cumulative.push(acc);
    }

    let mut out = Vec::with_capacity(n);
    let mut segment = 0usize;
    for index in 0..n {
        let target = total * index as f32 / (n - 1) as f32;
        while segment + 1 < cumulative.len() - 1 && cumulative[segment + 1] < target {
            segment += 1;
        }
        let span = cumulative[segment + 1] - cumulative[segment];
        let t = if span > 0.0 {
            (target - cumulative[segment]) / span
        } else {
            0.0
        };
        out.push(lerp(&points[segment], &points[segment + 1], t));
    }
    out
}

pub fn arc_length(points: &[[f32; 3]]) -> f32 {
    points
        .windows(2)
        .map(|pair| distance(&pair[0], &pair[1]))
        .sum()
}

fn distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

fn lerp(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

fn parse_header(header: &[u8; TRK_HEADER_SIZE], path: &Path) -> Result<TrkSpace> {
    if &header[..5] != TRK_MAGIC {
        bail!("{} is not a TRK file (bad magic)", path.display());
    }
    let declared_size = i32_at(header, 996);
    if declared_size != TRK_HEADER_SIZE as i32 {
        bail!(
            "{}: unsupported TRK header size {} (big-endian files are not supported)",
            path.display(),
            declared_size
        );
    }

    let dimensions = [i16_at(header, 6), i16_at(header, 8), i16_at(header, 10)];
    let voxel_sizes = [f32_at(header, 12), f32_at(header, 16), f32_at(header, 20)];
    let mut affine = [[0.0f32; 4]; 4];
    for (row, target) in affine.iter_mut().enumerate() {
        for (col, value) in target.iter_mut().enumerate() {
            *value = f32_at(header, 440 + (row * 4 + col) * 4);
        }
    }
    let voxel_order: String = header[948..952]
        .iter()
        .take_while(|&&byte| byte != 0)
        .map(|&byte| byte as char)
        .collect();

    Ok(TrkSpace {
        affine_to_rasmm: affine,
        dimensions,
        voxel_sizes,
        voxel_order,
    })
}

fn i16_at(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn i32_at(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Minimal little-endian TRK writer for test fixtures.
#[cfg(test)]
pub(crate) fn write_trk(path: &Path, streamlines: &[Vec<[f32; 3]>]) {
    let mut bytes = vec![0u8; TRK_HEADER_SIZE];
    bytes[..5].copy_from_slice(TRK_MAGIC);
    for (index, dim) in [10i16, 10, 10].iter().enumerate() {
        bytes[6 + index * 2..8 + index * 2].copy_from_slice(&dim.to_le_bytes());
    }
    for (index, size) in [2.0f32, 2.0, 2.0].iter().enumerate() {
        bytes[12 + index * 4..16 + index * 4].copy_from_slice(&size.to_le_bytes());
    }
    // Identity vox-to-ras.
    for row in 0..4 {
        bytes[440 + (row * 4 + row) * 4..444 + (row * 4 + row) * 4]
            .copy_from_slice(&1.0f32.to_le_bytes());
    }
    bytes[948..951].copy_from_slice(b"RAS");
    bytes[988..992].copy_from_slice(&(streamlines.len() as i32).to_le_bytes());
    bytes[992..996].copy_from_slice(&2i32.to_le_bytes());
    bytes[996..1000].copy_from_slice(&(TRK_HEADER_SIZE as i32).to_le_bytes());

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
