//! Train-split augmentation: rotated copies of positive buckets and
//! synthetic positives from a generative model.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::{concatenate, s, Array1, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bucket::{is_positive, INCIDENT_SUFFIX};
use crate::ledger::ClassCount;
use crate::store::BucketStore;
use crate::PrepError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationAxis {
    X,
    Y,
    Z,
}

impl RotationAxis {
    pub const ALL: [RotationAxis; 3] = [RotationAxis::X, RotationAxis::Y, RotationAxis::Z];

    /// Diagonal of the 180° rotation matrix about this axis.
    pub fn diagonal(self) -> [f64; 3] {
        match self {
            RotationAxis::X => [1.0, -1.0, -1.0],
            RotationAxis::Y => [-1.0, 1.0, -1.0],
            RotationAxis::Z => [-1.0, -1.0, 1.0],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RotationAxis::X => "X",
            RotationAxis::Y => "Y",
            RotationAxis::Z => "Z",
        }
    }
}

/// Rotate the accelerometer triple (channels 0..3) and the gyroscope triple
/// (3..6) by 180° about `axis`; every other channel passes through.
pub fn rotate_bucket(bucket: ArrayView3<'_, f64>, axis: RotationAxis) -> Array3<f64> {
    let mut out = bucket.to_owned();
    let diag = axis.diagonal();
    for triple in [0, 3] {
        for (k, sign) in diag.iter().enumerate() {
            out.index_axis_mut(Axis(2), triple + k).mapv_inplace(|v| v * sign);
        }
    }
    out
}

pub fn rotated_name(name: &str, axis: RotationAxis) -> String {
    format!(
        "{}_rotated_{}{}",
        name.replace(INCIDENT_SUFFIX, ""),
        axis.label(),
        INCIDENT_SUFFIX
    )
}

pub fn generated_name(index: usize) -> String {
    format!("generated_bucket_no{:015}{}", index, INCIDENT_SUFFIX)
}

/// Add three rotated copies of every positive bucket. Returns the number of
/// buckets added.
pub fn add_rotations(store: &mut dyn BucketStore) -> usize {
    let positives: Vec<(String, Array3<f64>)> = store
        .iter()
        .filter(|(_, b)| is_positive(b))
        .map(|(n, b)| (n.to_string(), b.clone()))
        .collect();
    let rotated: Vec<(String, Array3<f64>)> = positives
        .par_iter()
        .flat_map_iter(|(name, bucket)| {
            RotationAxis::ALL
                .iter()
                .map(move |&axis| (rotated_name(name, axis), rotate_bucket(bucket.view(), axis)))
        })
        .collect();
    let added = rotated.len();
    for (name, bucket) in rotated {
        store.push(name, bucket);
    }
    added
}

/// Number of synthetic positives to draw: a share of the class gap, none
/// when positives already match negatives.
pub fn synthetic_count(counts: ClassCount, ratio: f64) -> usize {
    if counts.negative <= counts.positive {
        return 0;
    }
    ((counts.negative - counts.positive) as f64 * ratio).floor() as usize
}

/// Produces label-free buckets `[count, window, slices, channels - 1]`.
pub trait Generator: Send + Sync {
    fn generate(&self, count: usize, noise_dim: usize, rng: &mut StdRng) -> Result<Array4<f64>, PrepError>;

    /// Persist into a checkpoint directory readable by the backend's `load`.
    fn save(&self, dir: &Path) -> Result<(), PrepError>;
}

/// Scores how plausible a label-free bucket is; higher is more plausible.
pub trait Discriminator: Send + Sync {
    fn score(&self, bucket: ArrayView3<'_, f64>) -> f64;
}

pub trait GenerativeBackend: Send + Sync {
    /// Load a generator from a checkpoint directory.
    fn load(&self, dir: &Path) -> Result<Box<dyn Generator>, PrepError>;

    /// Fit on label-free positive buckets.
    fn train(
        &self,
        positives: &[Array3<f64>],
        epochs: usize,
        batch_size: usize,
    ) -> Result<(Box<dyn Generator>, Box<dyn Discriminator>), PrepError>;
}

/// Mean discriminator score over label-free samples `[n, window, slices, c]`.
pub fn mean_score(discriminator: &dyn Discriminator, samples: ArrayView4<'_, f64>) -> Option<f64> {
    let n = samples.len_of(Axis(0));
    if n == 0 {
        return None;
    }
    let total: f64 = samples
        .axis_iter(Axis(0))
        .map(|sample| discriminator.score(sample))
        .sum();
    Some(total / n as f64)
}

/// Draw `count` synthetic positives, append a label channel of ones and add
/// them to the store. Returns how many were added.
pub fn add_generated(
    store: &mut dyn BucketStore,
    generator: &dyn Generator,
    discriminator: Option<&dyn Discriminator>,
    count: usize,
    noise_dim: usize,
    rng: &mut StdRng,
) -> Result<usize, PrepError> {
    if count == 0 {
        return Ok(0);
    }
    let expected = store.iter().next().map(|(_, b)| b.dim());
    let samples = generator.generate(count, noise_dim, rng)?;
    let (n, window, slices, features) = samples.dim();
    if n != count {
        return Err(PrepError::Generator(format!("asked for {} samples, got {}", count, n)));
    }
    if let Some(dim) = expected {
        if dim != (window, slices, features + 1) {
            return Err(PrepError::Generator(format!(
                "generated buckets are {:?} without label, store holds {:?}",
                (window, slices, features),
                dim
            )));
        }
    }
    if let Some(score) = discriminator.and_then(|d| mean_score(d, samples.view())) {
        debug!("generated {} buckets, mean discriminator score {:.4}", n, score);
    }
    let ones = Array4::<f64>::ones((n, window, slices, 1));
    let labeled = concatenate(Axis(3), &[samples.view(), ones.view()])
        .map_err(|e| PrepError::Generator(e.to_string()))?;
    for (i, bucket) in labeled.axis_iter(Axis(0)).enumerate() {
        store.push(generated_name(i), bucket.to_owned());
    }
    Ok(n)
}

/// Feature channels of the positive buckets, label dropped.
pub fn positive_features(store: &dyn BucketStore) -> Vec<Array3<f64>> {
    store
        .iter()
        .filter(|(_, b)| is_positive(b))
        .map(|(_, b)| {
            let c = b.len_of(Axis(2));
            b.slice(s![.., .., ..c - 1]).to_owned()
        })
        .collect()
}

pub const GAUSSIAN_CHECKPOINT: &str = "generator.json";

/// Independent normal per bucket cell, fit by mean and standard deviation
/// over the positive buckets.
#[derive(Clone, Copy, Debug, Default)]
pub struct GaussianBackend;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussianGenerator {
    pub shape: (usize, usize, usize),
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub samples: usize,
    pub trained_at: DateTime<Utc>,
}

impl GaussianGenerator {
    pub fn checkpoint_path(dir: &Path) -> PathBuf {
        dir.join(GAUSSIAN_CHECKPOINT)
    }

    fn cells(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }
}

impl Generator for GaussianGenerator {
    fn generate(&self, count: usize, noise_dim: usize, rng: &mut StdRng) -> Result<Array4<f64>, PrepError> {
        if noise_dim == 0 {
            return Err(PrepError::Generator("noise dimension must be positive".into()));
        }
        let (w, s, c) = self.shape;
        let mut out = Array4::zeros((count, w, s, c));
        for mut sample in out.axis_iter_mut(Axis(0)) {
            for ((cell, mean), std) in sample.iter_mut().zip(&self.mean).zip(&self.std) {
                let z: f64 = StandardNormal.sample(rng);
                *cell = mean + std * z;
            }
        }
        Ok(out)
    }

    fn save(&self, dir: &Path) -> Result<(), PrepError> {
        fs::create_dir_all(dir).map_err(|e| PrepError::io(dir, e))?;
        let path = Self::checkpoint_path(dir);
        let text = serde_json::to_string(self).map_err(|e| PrepError::Json {
            path: path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&path, text).map_err(|e| PrepError::io(&path, e))
    }
}

impl Discriminator for GaussianGenerator {
    /// Negative mean squared z-score of the bucket's cells.
    fn score(&self, bucket: ArrayView3<'_, f64>) -> f64 {
        if bucket.dim() != self.shape || self.cells() == 0 {
            return f64::NEG_INFINITY;
        }
        let total: f64 = bucket
            .iter()
            .zip(&self.mean)
            .zip(&self.std)
            .map(|((v, m), s)| {
                let z = if *s > 0.0 { (v - m) / s } else if v == m { 0.0 } else { f64::INFINITY };
                z * z
            })
            .sum();
        -total / self.cells() as f64
    }
}

impl GenerativeBackend for GaussianBackend {
    fn load(&self, dir: &Path) -> Result<Box<dyn Generator>, PrepError> {
        let path = GaussianGenerator::checkpoint_path(dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrepError::MissingArtifact(format!(
                    "no generator checkpoint at {}",
                    path.display()
                )))
            }
            Err(err) => return Err(PrepError::io(&path, err)),
        };
        let generator: GaussianGenerator = serde_json::from_str(&text).map_err(|e| PrepError::Json {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if generator.mean.len() != generator.cells() || generator.std.len() != generator.cells() {
            return Err(PrepError::Json {
                path,
                message: "checkpoint shape does not match its parameters".into(),
            });
        }
        Ok(Box::new(generator))
    }

    /// Streams the positives in batches of `batch_size`; a closed-form fit
    /// needs a single pass, so `epochs` only has to be positive.
    fn train(
        &self,
        positives: &[Array3<f64>],
        epochs: usize,
        batch_size: usize,
    ) -> Result<(Box<dyn Generator>, Box<dyn Discriminator>), PrepError> {
        let first = positives
            .first()
            .ok_or_else(|| PrepError::Generator("no positive buckets to train on".into()))?;
        if epochs == 0 || batch_size == 0 {
            return Err(PrepError::Generator("epochs and batch size must be positive".into()));
        }
        let shape = first.dim();
        if positives.iter().any(|b| b.dim() != shape) {
            return Err(PrepError::Generator("positive buckets differ in shape".into()));
        }

        let cells = first.len();
        let mut sum = Array1::<f64>::zeros(cells);
        let mut sum_sq = Array1::<f64>::zeros(cells);
        for (i, batch) in positives.chunks(batch_size).enumerate() {
            for bucket in batch {
                for (k, v) in bucket.iter().enumerate() {
                    sum[k] += v;
                    sum_sq[k] += v * v;
                }
            }
            debug!("gaussian generator: batch {} ({} buckets)", i, batch.len());
        }
        let n = positives.len() as f64;
        let mean = &sum / n;
        let std = (&sum_sq / n - &mean * &mean).mapv(|v| v.max(0.0).sqrt());

        let generator = GaussianGenerator {
            shape,
            mean: mean.to_vec(),
            std: std.to_vec(),
            samples: positives.len(),
            trained_at: Utc::now(),
        };
        Ok((Box::new(generator.clone()), Box::new(generator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContiguousStore, KeyedStore};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn bucket(label: f64) -> Array3<f64> {
        let mut b = Array3::from_shape_fn((5, 20, 9), |(w, s, c)| (w + s * 5) as f64 * 0.01 + c as f64);
        b.index_axis_mut(Axis(2), 8).fill(label);
        b
    }

    #[test]
    fn rotating_twice_about_one_axis_is_identity() {
        let b = bucket(1.0);
        for axis in RotationAxis::ALL {
            let once = rotate_bucket(b.view(), axis);
            assert_ne!(once, b);
            assert_eq!(rotate_bucket(once.view(), axis), b);
        }
    }

    #[test]
    fn rotation_leaves_gps_and_label() {
        let b = bucket(1.0);
        let r = rotate_bucket(b.view(), RotationAxis::Z);
        assert_eq!(r.slice(s![.., .., 6..]), b.slice(s![.., .., 6..]));
        assert_eq!(r[[1, 2, 0]], -b[[1, 2, 0]]);
        assert_eq!(r[[1, 2, 2]], b[[1, 2, 2]]);
        assert_eq!(r[[1, 2, 3]], -b[[1, 2, 3]]);
    }

    #[test]
    fn rotations_add_three_per_positive() {
        let mut store = KeyedStore::default();
        store.push("VM2_1_no00000_bucket".into(), bucket(0.0));
        store.push("VM2_1_no00001_bucket_incident".into(), bucket(1.0));
        assert_eq!(add_rotations(&mut store), 3);
        assert_eq!(store.len(), 5);
        assert!(store.get("VM2_1_no00001_rotated_Y_bucket_incident").is_some());
        assert_eq!(store.iter().filter(|(_, b)| is_positive(b)).count(), 4);
    }

    #[test]
    fn synthetic_count_is_a_share_of_the_gap() {
        let c = |positive, negative| ClassCount { positive, negative };
        assert_eq!(synthetic_count(c(4, 2), 0.1), 0);
        assert_eq!(synthetic_count(c(5, 5), 0.1), 0);
        assert_eq!(synthetic_count(c(10, 129), 0.1), 11);
    }

    #[test]
    fn gaussian_backend_trains_saves_and_loads() {
        let positives = vec![bucket(1.0).slice(s![.., .., ..8]).to_owned()];
        let (generator, discriminator) = GaussianBackend.train(&positives, 1, 3).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GaussianBackend.load(dir.path()),
            Err(PrepError::MissingArtifact(_))
        ));
        generator.save(dir.path()).unwrap();
        let loaded = GaussianBackend.load(dir.path()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let samples = loaded.generate(2, 100, &mut rng).unwrap();
        assert_eq!(samples.dim(), (2, 5, 20, 8));
        // A single training bucket has zero spread, so samples equal it.
        assert_abs_diff_eq!(samples[[1, 3, 7, 2]], positives[0][[3, 7, 2]], epsilon = 1e-9);
        assert_abs_diff_eq!(discriminator.score(positives[0].view()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn generated_buckets_are_labeled_positive() {
        let mut store = ContiguousStore::default();
        store.push(String::new(), bucket(0.0));
        let positives = vec![bucket(1.0).slice(s![.., .., ..8]).to_owned()];
        let (generator, discriminator) = GaussianBackend.train(&positives, 1, 128).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let added = add_generated(
            &mut store,
            generator.as_ref(),
            Some(discriminator.as_ref()),
            3,
            100,
            &mut rng,
        )
        .unwrap();
        assert_eq!(added, 3);
        assert_eq!(store.len(), 4);
        assert_eq!(store.iter().filter(|(_, b)| is_positive(b)).count(), 3);
        assert_eq!(generated_name(2), "generated_bucket_no000000000000002_bucket_incident");
    }

    #[test]
    fn samples_far_from_the_positives_score_lower() {
        let positives = vec![
            Array3::from_elem((5, 20, 8), 1.0),
            Array3::from_elem((5, 20, 8), 3.0),
        ];
        let (_, discriminator) = GaussianBackend.train(&positives, 1, 2).unwrap();
        let near = Array4::from_elem((2, 5, 20, 8), 2.0);
        let far = Array4::from_elem((2, 5, 20, 8), 7.0);
        let near = mean_score(discriminator.as_ref(), near.view()).unwrap();
        let far = mean_score(discriminator.as_ref(), far.view()).unwrap();
        assert_abs_diff_eq!(near, 0.0, epsilon = 1e-9);
        assert!(far < near);
        let empty = Array4::<f64>::zeros((0, 5, 20, 8));
        assert_eq!(mean_score(discriminator.as_ref(), empty.view()), None);
    }

    #[test]
    fn mismatched_generator_shape_is_rejected() {
        let mut store = ContiguousStore::default();
        store.push(String::new(), bucket(0.0));
        let positives = vec![Array3::zeros((5, 20, 4))];
        let (generator, _) = GaussianBackend.train(&positives, 1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            add_generated(&mut store, generator.as_ref(), None, 1, 100, &mut rng),
            Err(PrepError::Generator(_))
        ));
    }
}
