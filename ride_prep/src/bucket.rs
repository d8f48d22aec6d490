//! Slicing scaled rides into fixed-size labeled buckets.

use std::path::Path;

use ndarray::{s, Array2, Array3, ArrayView2, Axis};

use crate::ride::{Column, Ride};
use crate::{PrepConfig, PrepError};

pub const BUCKET_SUFFIX: &str = "_bucket";
pub const INCIDENT_SUFFIX: &str = "_bucket_incident";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub window_size: usize,
    pub slices: usize,
    pub edge_trim_rows: usize,
}

impl Geometry {
    pub fn from_config(config: &PrepConfig) -> Self {
        Self {
            window_size: config.window_size,
            slices: config.slices,
            edge_trim_rows: config.edge_trim_rows,
        }
    }

    pub fn rows_per_bucket(&self) -> usize {
        self.window_size * self.slices
    }

    /// Buckets a ride of `rows` rows produces.
    pub fn bucket_count(&self, rows: usize) -> usize {
        rows.saturating_sub(2 * self.edge_trim_rows) / self.rows_per_bucket()
    }
}

/// Dense `[rows, columns]` matrix of a ride in `layout` order. Every cell
/// must hold a value.
pub fn ride_matrix(path: &Path, ride: &Ride, layout: &[Column]) -> Result<Array2<f64>, PrepError> {
    let mut out = Array2::zeros((ride.len(), layout.len()));
    for (j, &col) in layout.iter().enumerate() {
        let values = ride
            .column(col)
            .ok_or_else(|| PrepError::corrupt(path, format!("missing column '{}'", col.header())))?;
        for (i, v) in values.iter().enumerate() {
            out[[i, j]] = v.ok_or_else(|| {
                PrepError::corrupt(path, format!("row {}: empty '{}' cell", i + 1, col.header()))
            })?;
        }
    }
    Ok(out)
}

/// Cut `rows` (label in the last column) into buckets of shape
/// `[window_size, slices, channels]`.
///
/// Edge rows are trimmed and the tail that does not fill a bucket is dropped.
/// Within a bucket, row `s * window_size + w` lands at `[w, s, ..]`. The label
/// channel is set to 1 everywhere if any contributing row is positive, else 0.
pub fn bucketize(rows: ArrayView2<'_, f64>, geometry: Geometry) -> Vec<Array3<f64>> {
    let n = geometry.bucket_count(rows.nrows());
    let per_bucket = geometry.rows_per_bucket();
    let channels = rows.ncols();
    let start = geometry.edge_trim_rows;

    (0..n)
        .map(|b| {
            let chunk = rows.slice(s![start + b * per_bucket..start + (b + 1) * per_bucket, ..]);
            let mut bucket = Array3::zeros((geometry.window_size, geometry.slices, channels));
            for (i, row) in chunk.axis_iter(Axis(0)).enumerate() {
                let (slice, w) = (i / geometry.window_size, i % geometry.window_size);
                bucket.slice_mut(s![w, slice, ..]).assign(&row);
            }
            if channels > 0 {
                let positive = chunk.column(channels - 1).iter().any(|&v| v > 0.0);
                bucket
                    .index_axis_mut(Axis(2), channels - 1)
                    .fill(if positive { 1.0 } else { 0.0 });
            }
            bucket
        })
        .collect()
}

/// Label of a bucket: positive if any label cell is set.
pub fn is_positive(bucket: &Array3<f64>) -> bool {
    let channels = bucket.len_of(Axis(2));
    channels > 0 && bucket.index_axis(Axis(2), channels - 1).iter().any(|&v| v > 0.0)
}

/// Keyed-store name of the `index`-th bucket of a ride.
pub fn bucket_name(stem: &str, index: usize, positive: bool) -> String {
    let suffix = if positive { INCIDENT_SUFFIX } else { BUCKET_SUFFIX };
    format!("{}_no{:05}{}", stem, index, suffix)
}

/// Read a scaled ride file and cut it into named buckets. A ride that yields
/// no bucket is corrupt.
pub fn bucketize_file(
    path: &Path,
    layout: &[Column],
    geometry: Geometry,
) -> Result<Vec<(String, Array3<f64>)>, PrepError> {
    let ride = Ride::read_csv(path)?;
    let matrix = ride_matrix(path, &ride, layout)?;
    let buckets = bucketize(matrix.view(), geometry);
    if buckets.is_empty() {
        return Err(PrepError::corrupt(
            path,
            format!(
                "{} rows yield no bucket of {} rows after trimming {} rows per edge",
                ride.len(),
                geometry.rows_per_bucket(),
                geometry.edge_trim_rows
            ),
        ));
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(buckets
        .into_iter()
        .enumerate()
        .map(|(i, b)| (bucket_name(&stem, i, is_positive(&b)), b))
        .collect())
}
