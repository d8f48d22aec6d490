//! Statistics fit on the train split and applied to every split.
//!
//! A [`TwoPhase`] stage first observes each train ride independently, then
//! reduces the partial observations into immutable parameters, and only then
//! transforms rides of any split. [`fit`] refuses any partition other than
//! train.

use std::fs;
use std::path::{Path, PathBuf};

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::pipeline::{for_each_ride, FileOutcome, Tally};
use crate::ride::Ride;
use crate::{PrepError, Split};

/// Result of applying fitted parameters to one ride.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    Discard,
}

pub trait TwoPhase: Sync {
    type Partial: Send;
    type Params: Send + Sync;

    fn name(&self) -> &'static str;

    /// Per-ride contribution. `Ok(None)` marks a train ride with nothing to
    /// contribute; it is deleted.
    fn observe(&self, path: &Path, ride: &Ride) -> Result<Option<Self::Partial>, PrepError>;

    fn finish(&self, partials: Vec<Self::Partial>) -> Result<Self::Params, String>;

    fn apply(&self, params: &Self::Params, path: &Path, ride: &mut Ride)
        -> Result<Applied, PrepError>;
}

/// Files of one split, as seen by a fit.
#[derive(Clone, Copy, Debug)]
pub struct Partition<'a> {
    pub split: Split,
    pub dir: &'a Path,
    pub files: &'a [PathBuf],
}

#[derive(Clone, Debug)]
pub struct Fitted<P> {
    pub params: P,
    pub observed: usize,
    pub discarded: Vec<PathBuf>,
}

/// Reduce a statistic over the train partition. Train rides without a
/// contribution are removed from disk.
pub fn fit<T: TwoPhase>(stage: &T, partition: Partition<'_>) -> Result<Fitted<T::Params>, PrepError> {
    if partition.split != Split::Train {
        return Err(PrepError::Leakage {
            stage: stage.name(),
            split: partition.split,
        });
    }

    let observations: Vec<(PathBuf, Option<T::Partial>)> = partition
        .files
        .par_iter()
        .map(|path| {
            let ride = Ride::read_csv(path)?;
            Ok((path.clone(), stage.observe(path, &ride)?))
        })
        .collect::<Result<Vec<_>, PrepError>>()?;

    let mut partials = Vec::with_capacity(observations.len());
    let mut discarded = Vec::new();
    for (path, partial) in observations {
        match partial {
            Some(p) => partials.push(p),
            None => {
                fs::remove_file(&path).map_err(|e| PrepError::io(&path, e))?;
                debug!("{}: no {} sample, removed", path.display(), stage.name());
                discarded.push(path);
            }
        }
    }

    let observed = partials.len();
    let params = stage
        .finish(partials)
        .map_err(|reason| PrepError::corrupt(partition.dir, reason))?;
    info!(
        "{}: fit on {} train rides ({} discarded)",
        stage.name(),
        observed,
        discarded.len()
    );
    Ok(Fitted {
        params,
        observed,
        discarded,
    })
}

/// Apply fitted parameters to every ride of one split in parallel.
pub fn apply<T: TwoPhase>(stage: &T, params: &T::Params, files: &[PathBuf]) -> Result<Tally, PrepError> {
    for_each_ride(files, |path, ride| {
        Ok(match stage.apply(params, path, ride)? {
            Applied::Changed => FileOutcome::Rewrite,
            Applied::Unchanged => FileOutcome::Unchanged,
            Applied::Discard => FileOutcome::Delete,
        })
    })
}

/// Percentile with linear interpolation between closest ranks; `sorted`
/// must be ascending and non-empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let pos = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Tukey fence `[Q25 - k*IQR, Q75 + k*IQR]`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct IqrBounds {
    pub lower: f64,
    pub upper: f64,
}

impl IqrBounds {
    pub fn from_samples(mut samples: Vec<f64>, k: f64) -> Option<Self> {
        samples.retain(|v| v.is_finite());
        if samples.is_empty() {
            return None;
        }
        samples.sort_by_key(|&v| OrderedFloat(v));
        let q25 = percentile(&samples, 25.0);
        let q75 = percentile(&samples, 75.0);
        let cut = (q75 - q25) * k;
        Some(Self {
            lower: q25 - cut,
            upper: q75 + cut,
        })
    }

    /// Missing values are never outliers.
    pub fn is_outlier(&self, value: Option<f64>) -> bool {
        match value {
            Some(v) => v < self.lower || v > self.upper,
            None => false,
        }
    }
}
