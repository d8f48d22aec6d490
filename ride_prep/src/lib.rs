//! Ride telemetry preprocessing: turns per-ride sensor CSV exports into
//! fixed-size, labeled incident buckets.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod augment;
pub mod bucket;
pub mod clean;
pub mod fourier;
pub mod ledger;
pub mod outliers;
pub mod pipeline;
pub mod resample;
pub mod ride;
pub mod scaler;
pub mod stats;
pub mod store;
pub mod velocity;

pub use augment::{GaussianBackend, GenerativeBackend, Generator};
pub use pipeline::{Artifacts, Pipeline, RunReport, Stage};
pub use ride::{Column, Device, Ride};
pub use store::{BucketStore, ContiguousStore, KeyedStore};

#[derive(Error, Debug)]
pub enum PrepError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read CSV {}: {message}", .path.display())]
    Csv { path: PathBuf, message: String },
    #[error("bucket archive {}: {message}", .path.display())]
    Archive { path: PathBuf, message: String },
    #[error("invalid JSON in {}: {message}", .path.display())]
    Json { path: PathBuf, message: String },
    #[error("corrupted data in {}: {reason}", .path.display())]
    DataCorruption { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("missing artifact: {0}")]
    MissingArtifact(String),
    #[error("train-only statistic `{stage}` was fit on the {split} split")]
    Leakage { stage: &'static str, split: Split },
    #[error("generator failure: {0}")]
    Generator(String),
}

impl PrepError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PrepError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        PrepError::DataCorruption {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
    Val,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Test, Split::Val];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resampling strategy. Parsed late from [`PrepConfig::interpolation`] so an
/// unknown name only skips the resample stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Equidistant,
}

impl FromStr for Interpolation {
    type Err = PrepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Interpolation::Linear),
            "equidistant" => Ok(Interpolation::Equidistant),
            other => Err(PrepError::Configuration(format!(
                "unknown interpolation strategy '{}'",
                other
            ))),
        }
    }
}

/// How buckets of one split are laid out in the archive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// One `[n, window, slices, channels]` array.
    InMemory,
    /// One array per named bucket.
    Keyed,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::InMemory
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    pub data_dir: PathBuf,
    pub region: String,
    pub file_prefix: String,
    pub interpolation: String,
    pub time_interval_ms: i64,
    pub max_gap_ms: f64,
    pub accuracy_iqr_k: f64,
    pub velocity_iqr_k: f64,
    pub window_size: usize,
    pub slices: usize,
    pub edge_trim_rows: usize,
    pub lin_acc: bool,
    pub store_mode: StoreMode,
    pub fourier: bool,
    pub rotation: bool,
    pub generative: bool,
    pub gan_epochs: usize,
    pub batch_size: usize,
    pub latent_dim: usize,
    pub synthetic_ratio: f64,
    pub class_counts_file: String,
    pub scaler_file: String,
    pub gan_checkpoint_dir: PathBuf,
    pub workers: Option<usize>,
    pub seed: u64,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            region: "Berlin".to_string(),
            file_prefix: "VM2_".to_string(),
            interpolation: "equidistant".to_string(),
            time_interval_ms: 100,
            max_gap_ms: 6000.0,
            accuracy_iqr_k: 1.5,
            velocity_iqr_k: 3.0,
            window_size: 5,
            slices: 20,
            edge_trim_rows: 60,
            lin_acc: false,
            store_mode: StoreMode::InMemory,
            fourier: true,
            rotation: false,
            generative: true,
            gan_epochs: 1000,
            batch_size: 128,
            latent_dim: 100,
            synthetic_ratio: 0.1,
            class_counts_file: "class_counts.csv".to_string(),
            scaler_file: "scaler.save".to_string(),
            gan_checkpoint_dir: PathBuf::from("gan_checkpoints"),
            workers: None,
            seed: 0,
        }
    }
}

impl PrepConfig {
    /// Load a config from JSON; absent keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PrepError> {
        let text = fs::read_to_string(path).map_err(|e| PrepError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| PrepError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), PrepError> {
        let bad = |msg: &str| Err(PrepError::Configuration(msg.to_string()));
        if self.window_size == 0 || self.slices == 0 {
            return bad("window_size and slices must be > 0");
        }
        if self.time_interval_ms <= 0 {
            return bad("time_interval_ms must be > 0");
        }
        if !(self.max_gap_ms > 0.0) {
            return bad("max_gap_ms must be > 0");
        }
        if self.accuracy_iqr_k < 0.0 || self.velocity_iqr_k < 0.0 {
            return bad("IQR multipliers must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.synthetic_ratio) {
            return bad("synthetic_ratio must lie in [0, 1]");
        }
        if self.generative && self.latent_dim == 0 {
            return bad("latent_dim must be > 0 when generative augmentation is enabled");
        }
        if self.region.is_empty() {
            return bad("region must not be empty");
        }
        Ok(())
    }

    /// Number of channels in a bucket, label included.
    pub fn bucket_channels(&self) -> usize {
        ride::feature_layout(self.lin_acc).len() + 1
    }

    pub fn rows_per_bucket(&self) -> usize {
        self.window_size * self.slices
    }

    pub fn region_dir(&self, split: Split) -> PathBuf {
        self.data_dir.join(split.as_str()).join(&self.region)
    }

    pub fn archive_path(&self, split: Split) -> PathBuf {
        self.data_dir
            .join(split.as_str())
            .join(format!("{}.npz", self.region))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.class_counts_file)
    }

    pub fn scaler_path(&self) -> PathBuf {
        self.data_dir.join(&self.scaler_file)
    }

    /// Generator checkpoints; relative paths live under the data directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        if self.gan_checkpoint_dir.is_absolute() {
            self.gan_checkpoint_dir.clone()
        } else {
            self.data_dir.join(&self.gan_checkpoint_dir)
        }
    }

    /// Ride files of one split, sorted by name. A missing directory means
    /// the split has no rides left.
    pub fn ride_files(&self, split: Split) -> Result<Vec<PathBuf>, PrepError> {
        let dir = self.region_dir(split);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PrepError::io(&dir, err)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::io(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_file() && name.starts_with(&self.file_prefix) && name.ends_with(".csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
