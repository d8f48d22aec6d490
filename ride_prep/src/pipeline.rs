//! Stage orchestration over the split directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::augment::{self, Discriminator, GenerativeBackend, Generator};
use crate::bucket::{self, Geometry};
use crate::clean::{self, Invalid};
use crate::fourier::{self, FourierTransform};
use crate::ledger::{ClassCount, Ledger};
use crate::outliers::{AccuracyOutliers, VelocityOutliers};
use crate::resample;
use crate::ride::{output_layout, Column, Device, Ride};
use crate::scaler::{MaxAbsScaler, MaxAbsScaling};
use crate::stats::{self, Partition, TwoPhase};
use crate::store::{self, BucketStore};
use crate::velocity;
use crate::{Interpolation, PrepConfig, PrepError, Split};

/// What a per-ride step wants done with the file afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Rewrite,
    Unchanged,
    Delete,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Tally {
    pub rewritten: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl Tally {
    fn record(mut self, outcome: FileOutcome) -> Self {
        match outcome {
            FileOutcome::Rewrite => self.rewritten += 1,
            FileOutcome::Unchanged => self.unchanged += 1,
            FileOutcome::Delete => self.deleted += 1,
        }
        self
    }

    fn merge(self, other: Tally) -> Self {
        Tally {
            rewritten: self.rewritten + other.rewritten,
            unchanged: self.unchanged + other.unchanged,
            deleted: self.deleted + other.deleted,
        }
    }

    pub fn files(&self) -> usize {
        self.rewritten + self.unchanged + self.deleted
    }
}

/// Read every ride, let `step` transform it, then rewrite or delete the file
/// as asked. Files are processed in parallel; the first failure aborts.
pub fn for_each_ride<F>(files: &[PathBuf], step: F) -> Result<Tally, PrepError>
where
    F: Fn(&Path, &mut Ride) -> Result<FileOutcome, PrepError> + Sync,
{
    let outcomes = files
        .par_iter()
        .map(|path| {
            let mut ride = Ride::read_csv(path)?;
            let outcome = step(path, &mut ride)?;
            match outcome {
                FileOutcome::Rewrite => ride.write_csv(path)?,
                FileOutcome::Delete => fs::remove_file(path).map_err(|e| PrepError::io(path, e))?,
                FileOutcome::Unchanged => {}
            }
            Ok(outcome)
        })
        .collect::<Result<Vec<_>, PrepError>>()?;
    Ok(outcomes.into_iter().fold(Tally::default(), Tally::record))
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    SortTimestamps,
    FilterInvalid,
    Decontaminate,
    AccuracyOutliers,
    Velocity,
    Resample,
    VelocityOutliers,
    CleanRows,
    Scale,
    Bucketize,
    Augment,
    Fourier,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::SortTimestamps,
        Stage::FilterInvalid,
        Stage::Decontaminate,
        Stage::AccuracyOutliers,
        Stage::Velocity,
        Stage::Resample,
        Stage::VelocityOutliers,
        Stage::CleanRows,
        Stage::Scale,
        Stage::Bucketize,
        Stage::Augment,
        Stage::Fourier,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::SortTimestamps => "sort-timestamps",
            Stage::FilterInvalid => "filter-invalid",
            Stage::Decontaminate => "decontaminate",
            Stage::AccuracyOutliers => "accuracy-outliers",
            Stage::Velocity => "velocity",
            Stage::Resample => "resample",
            Stage::VelocityOutliers => "velocity-outliers",
            Stage::CleanRows => "clean-rows",
            Stage::Scale => "scale",
            Stage::Bucketize => "bucketize",
            Stage::Augment => "augment",
            Stage::Fourier => "fourier",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub tally: Tally,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ArchiveSummary {
    pub split: Split,
    pub path: PathBuf,
    pub buckets: usize,
    pub shape: Option<(usize, usize, usize)>,
    pub counts: ClassCount,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Loaded,
    Fitted,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    /// Set when a stage could not run and the remaining stages were skipped.
    pub halted_after: Option<Stage>,
    pub scaler: Option<ArtifactSource>,
    pub generator: Option<ArtifactSource>,
    pub archives: Vec<ArchiveSummary>,
    pub elapsed_ms: f64,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// Persisted parameters, resolved once before any file is touched.
pub struct Artifacts {
    pub scaler: Option<MaxAbsScaler>,
    pub generator: Option<Box<dyn Generator>>,
}

impl Artifacts {
    /// Load the saved scaler and generator when present. Absent artifacts
    /// are left for the owning stage to fit.
    pub fn resolve(config: &PrepConfig, backend: Option<&dyn GenerativeBackend>) -> Result<Self, PrepError> {
        let scaler = match MaxAbsScaler::load(&config.scaler_path()) {
            Ok(scaler) => {
                scaler.check_layout(config.lin_acc)?;
                info!("loaded scaler fitted at {}", scaler.fitted_at);
                Some(scaler)
            }
            Err(PrepError::MissingArtifact(msg)) => {
                debug!("{}", msg);
                None
            }
            Err(err) => return Err(err),
        };

        let generator = if config.generative {
            let backend = backend.ok_or_else(|| {
                PrepError::Configuration("generative augmentation needs a generator backend".into())
            })?;
            match backend.load(&config.checkpoint_dir()) {
                Ok(generator) => {
                    info!("loaded generator from {}", config.checkpoint_dir().display());
                    Some(generator)
                }
                Err(err) => {
                    info!("no usable generator checkpoint ({}), a new one will be trained", err);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { scaler, generator })
    }
}

pub struct Pipeline<'a> {
    config: PrepConfig,
    backend: Option<&'a dyn GenerativeBackend>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: PrepConfig) -> Self {
        Self {
            config,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: &'a dyn GenerativeBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &PrepConfig {
        &self.config
    }

    /// Run every stage in order over all splits.
    pub fn run(&self) -> Result<RunReport, PrepError> {
        self.config.validate()?;
        match self.config.workers {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| PrepError::Configuration(format!("worker pool: {}", e)))?;
                pool.install(|| self.run_stages())
            }
            None => self.run_stages(),
        }
    }

    fn run_stages(&self) -> Result<RunReport, PrepError> {
        let started = Instant::now();
        let config = &self.config;
        let mut artifacts = Artifacts::resolve(config, self.backend)?;
        let mut report = RunReport::default();

        self.timed(&mut report, Stage::SortTimestamps, |p| {
            p.per_ride(|path, ride| {
                if ride.timestamps().is_none() {
                    return Err(PrepError::corrupt(path, "row without timestamp"));
                }
                if clean::is_sorted(ride) {
                    return Ok(FileOutcome::Unchanged);
                }
                clean::sort_by_timestamp(ride);
                Ok(FileOutcome::Rewrite)
            })
        })?;

        self.timed(&mut report, Stage::FilterInvalid, |p| {
            p.per_ride(|path, ride| match clean::check_ride(ride, p.config.max_gap_ms) {
                Ok(()) => Ok(FileOutcome::Unchanged),
                Err(Invalid::Gap { at_row, gap_ms }) => {
                    debug!("{}: {} ms gap at row {}, removed", path.display(), gap_ms, at_row);
                    Ok(FileOutcome::Delete)
                }
                Err(Invalid::NoCompleteRows) => {
                    debug!("{}: no complete row, removed", path.display());
                    Ok(FileOutcome::Delete)
                }
            })
        })?;

        self.timed(&mut report, Stage::Decontaminate, |p| {
            p.per_ride(|path, ride| {
                if Device::from_path(path) != Device::Android {
                    return Ok(FileOutcome::Unchanged);
                }
                Ok(match clean::blank_inertial_on_gps_rows(ride, p.config.lin_acc) {
                    0 => FileOutcome::Unchanged,
                    _ => FileOutcome::Rewrite,
                })
            })
        })?;

        self.timed(&mut report, Stage::AccuracyOutliers, |p| {
            p.two_phase(&AccuracyOutliers {
                k: p.config.accuracy_iqr_k,
            })
        })?;

        self.timed(&mut report, Stage::Velocity, |p| {
            p.per_ride(|_, ride| {
                if !ride.has(Column::Lat) || !ride.has(Column::Lon) {
                    return Ok(FileOutcome::Unchanged);
                }
                velocity::to_velocity_deltas(ride);
                Ok(FileOutcome::Rewrite)
            })
        })?;

        let interpolation = match config.interpolation.parse::<Interpolation>() {
            Ok(interpolation) => interpolation,
            Err(err) => {
                warn!("{}; skipping resampling and every later stage", err);
                report.stages.push(StageReport {
                    stage: Stage::Resample,
                    tally: Tally::default(),
                    elapsed_ms: 0.0,
                    note: Some(err.to_string()),
                });
                report.halted_after = Some(Stage::Resample);
                report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                return Ok(report);
            }
        };
        self.timed(&mut report, Stage::Resample, |p| p.resample(interpolation))?;

        self.timed(&mut report, Stage::VelocityOutliers, |p| {
            p.two_phase(&VelocityOutliers {
                k: p.config.velocity_iqr_k,
            })
        })?;

        self.timed(&mut report, Stage::CleanRows, |p| {
            p.per_ride(|_, ride| {
                let removed = clean::drop_incomplete_rows(ride);
                Ok(if ride.is_empty() {
                    FileOutcome::Delete
                } else if removed > 0 {
                    FileOutcome::Rewrite
                } else {
                    FileOutcome::Unchanged
                })
            })
        })?;

        let stage_started = Instant::now();
        let (scaler, source) = match artifacts.scaler.take() {
            Some(scaler) => (scaler, ArtifactSource::Loaded),
            None => (self.fit_scaler()?, ArtifactSource::Fitted),
        };
        report.scaler = Some(source);
        let tally = self.across_splits(|files| {
            stats::apply(&MaxAbsScaling { lin_acc: config.lin_acc }, &scaler, files)
        })?;
        Self::record(&mut report, Stage::Scale, tally, stage_started, None);

        let stage_started = Instant::now();
        let tally = self.bucketize(&mut report)?;
        Self::record(&mut report, Stage::Bucketize, tally, stage_started, None);

        let stage_started = Instant::now();
        if config.rotation || config.generative {
            let tally = self.augment(&mut report, &mut artifacts)?;
            Self::record(&mut report, Stage::Augment, tally, stage_started, None);
        } else {
            Self::record(&mut report, Stage::Augment, Tally::default(), stage_started, Some("disabled"));
        }

        let stage_started = Instant::now();
        if config.fourier {
            let tally = self.fourier(&mut report)?;
            Self::record(&mut report, Stage::Fourier, tally, stage_started, None);
        } else {
            Self::record(&mut report, Stage::Fourier, Tally::default(), stage_started, Some("disabled"));
        }

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!("pipeline finished in {:.1} s", report.elapsed_ms / 1000.0);
        Ok(report)
    }

    fn timed<F>(&self, report: &mut RunReport, stage: Stage, run: F) -> Result<(), PrepError>
    where
        F: FnOnce(&Self) -> Result<Tally, PrepError>,
    {
        let started = Instant::now();
        let tally = run(self)?;
        Self::record(report, stage, tally, started, None);
        Ok(())
    }

    fn record(report: &mut RunReport, stage: Stage, tally: Tally, started: Instant, note: Option<&str>) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            "{}: {} rewritten, {} unchanged, {} deleted ({:.0} ms)",
            stage.name(),
            tally.rewritten,
            tally.unchanged,
            tally.deleted,
            elapsed_ms
        );
        report.stages.push(StageReport {
            stage,
            tally,
            elapsed_ms,
            note: note.map(str::to_string),
        });
    }

    fn across_splits<F>(&self, mut run: F) -> Result<Tally, PrepError>
    where
        F: FnMut(&[PathBuf]) -> Result<Tally, PrepError>,
    {
        let mut total = Tally::default();
        for split in Split::ALL {
            let files = self.config.ride_files(split)?;
            total = total.merge(run(&files)?);
        }
        Ok(total)
    }

    fn per_ride<F>(&self, step: F) -> Result<Tally, PrepError>
    where
        F: Fn(&Path, &mut Ride) -> Result<FileOutcome, PrepError> + Sync,
    {
        self.across_splits(|files| for_each_ride(files, &step))
    }

    fn train_partition<T: TwoPhase>(&self, stage: &T) -> Result<stats::Fitted<T::Params>, PrepError> {
        let dir = self.config.region_dir(Split::Train);
        let files = self.config.ride_files(Split::Train)?;
        stats::fit(
            stage,
            Partition {
                split: Split::Train,
                dir: &dir,
                files: &files,
            },
        )
    }

    /// Fit on train, then apply to every split. Train rides dropped during
    /// the fit count as deleted.
    fn two_phase<T: TwoPhase>(&self, stage: &T) -> Result<Tally, PrepError> {
        let fitted = self.train_partition(stage)?;
        let discarded = Tally {
            deleted: fitted.discarded.len(),
            ..Tally::default()
        };
        let applied = self.across_splits(|files| stats::apply(stage, &fitted.params, files))?;
        Ok(applied.merge(discarded))
    }

    fn fit_scaler(&self) -> Result<MaxAbsScaler, PrepError> {
        let fitted = self.train_partition(&MaxAbsScaling {
            lin_acc: self.config.lin_acc,
        })?;
        let path = self.config.scaler_path();
        fitted.params.save(&path)?;
        info!("saved scaler to {}", path.display());
        Ok(fitted.params)
    }

    fn resample(&self, interpolation: Interpolation) -> Result<Tally, PrepError> {
        let lin_acc = self.config.lin_acc;
        let interval = self.config.time_interval_ms;
        self.per_ride(|path, ride| {
            let columns = resample::interpolated_columns(Device::from_path(path), lin_acc);
            match interpolation {
                Interpolation::Linear => {
                    resample::linear(ride, &columns).map_err(|r| PrepError::corrupt(path, r))?;
                }
                Interpolation::Equidistant => {
                    let summary = resample::equidistant(ride, interval, &columns)
                        .map_err(|r| PrepError::corrupt(path, r))?;
                    if summary.dropped_incidents > 0 {
                        warn!(
                            "{}: {} incident(s) had no grid row and were dropped",
                            path.display(),
                            summary.dropped_incidents
                        );
                    }
                    let shared = summary.assignments.iter().filter(|a| a.shared).count();
                    if shared > 0 {
                        warn!("{}: {} incident(s) share a grid row", path.display(), shared);
                    }
                    debug!(
                        "{}: {} grid rows, {} inserted, {} removed",
                        path.display(),
                        summary.grid_rows,
                        summary.inserted,
                        summary.removed
                    );
                }
            }
            Ok(FileOutcome::Rewrite)
        })
    }

    /// Replace each split's ride files by one archive and record its class
    /// counts in the ledger.
    fn bucketize(&self, report: &mut RunReport) -> Result<Tally, PrepError> {
        let config = &self.config;
        let geometry = Geometry::from_config(config);
        let layout = output_layout(config.lin_acc);
        let ledger_path = config.ledger_path();
        let mut ledger = Ledger::load(&ledger_path)?;
        let mut tally = Tally::default();

        for split in Split::ALL {
            let files = config.ride_files(split)?;
            let per_file = files
                .par_iter()
                .map(|path| bucket::bucketize_file(path, &layout, geometry))
                .collect::<Result<Vec<_>, PrepError>>()?;

            let mut archive = store::empty_store(config.store_mode);
            archive.set_bucket_shape((geometry.window_size, geometry.slices, config.bucket_channels()));
            let mut counts = ClassCount::default();
            for (name, bucket) in per_file.into_iter().flatten() {
                if bucket::is_positive(&bucket) {
                    counts.positive += 1;
                } else {
                    counts.negative += 1;
                }
                archive.push(name, bucket);
            }

            let path = config.archive_path(split);
            let staged = store::stage(archive.as_ref(), &path)?;
            store::commit(&staged, &path)?;
            for file in &files {
                fs::remove_file(file).map_err(|e| PrepError::io(file, e))?;
            }
            remove_region_dir(&config.region_dir(split));

            ledger.set(&Ledger::key(split, &config.region), counts);
            let staged = ledger.stage(&ledger_path)?;
            Ledger::commit(&staged, &ledger_path)?;

            info!(
                "{}: {} buckets ({} positive, {} negative) from {} rides",
                path.display(),
                archive.len(),
                counts.positive,
                counts.negative,
                files.len()
            );
            tally.deleted += files.len();
            report.archives.push(summarize(split, &path, archive.as_ref(), counts));
        }
        Ok(tally)
    }

    fn augment(&self, report: &mut RunReport, artifacts: &mut Artifacts) -> Result<Tally, PrepError> {
        let config = &self.config;
        let path = config.archive_path(Split::Train);
        let ledger_path = config.ledger_path();
        let key = Ledger::key(Split::Train, &config.region);

        let mut archive = store::open_store(config.store_mode, &path)?;
        let mut ledger = Ledger::load(&ledger_path)?;
        let mut counts = ledger
            .get(&key)
            .unwrap_or_else(|| count_labels(archive.as_ref()));

        if config.rotation {
            let added = augment::add_rotations(archive.as_mut());
            counts.positive += added as u64;
            info!("rotation: {} buckets added", added);
        }

        if config.generative {
            let mut rng = StdRng::seed_from_u64(config.seed);
            let count = augment::synthetic_count(counts, config.synthetic_ratio);
            if count == 0 {
                info!("generation: classes balanced, nothing to generate");
            } else {
                let resolved = match artifacts.generator.take() {
                    Some(generator) => Some((generator, None, ArtifactSource::Loaded)),
                    None => self
                        .train_generator(archive.as_ref())?
                        .map(|(g, d)| (g, Some(d), ArtifactSource::Fitted)),
                };
                match resolved {
                    Some((generator, discriminator, source)) => {
                        report.generator = Some(source);
                        let added = augment::add_generated(
                            archive.as_mut(),
                            generator.as_ref(),
                            discriminator.as_deref(),
                            count,
                            config.latent_dim,
                            &mut rng,
                        )?;
                        counts.positive += added as u64;
                        info!("generation: {} synthetic positives added", added);
                    }
                    None => warn!(
                        "generation: no positive buckets to train on, skipping {} synthetic positives",
                        count
                    ),
                }
            }
            archive.shuffle(&mut rng);
        }

        // Archive and ledger are both staged before either replaces its file.
        ledger.set(&key, counts);
        let staged_archive = store::stage(archive.as_ref(), &path)?;
        let staged_ledger = ledger.stage(&ledger_path)?;
        store::commit(&staged_archive, &path)?;
        Ledger::commit(&staged_ledger, &ledger_path)?;

        update_summary(report, summarize(Split::Train, &path, archive.as_ref(), counts));
        Ok(Tally {
            rewritten: 1,
            ..Tally::default()
        })
    }

    /// Fit a generator on the archive's positives. `None` when there are none.
    fn train_generator(
        &self,
        archive: &dyn BucketStore,
    ) -> Result<Option<(Box<dyn Generator>, Box<dyn Discriminator>)>, PrepError> {
        let config = &self.config;
        let backend = self.backend.ok_or_else(|| {
            PrepError::Configuration("generative augmentation needs a generator backend".into())
        })?;
        let positives = augment::positive_features(archive);
        if positives.is_empty() {
            return Ok(None);
        }
        info!(
            "training generator on {} positive buckets ({} epochs, batch {})",
            positives.len(),
            config.gan_epochs,
            config.batch_size
        );
        let (generator, discriminator) = backend.train(&positives, config.gan_epochs, config.batch_size)?;
        let dir = config.checkpoint_dir();
        generator.save(&dir)?;
        info!("saved generator checkpoint to {}", dir.display());
        Ok(Some((generator, discriminator)))
    }

    fn fourier(&self, report: &mut RunReport) -> Result<Tally, PrepError> {
        let config = &self.config;
        let transform = FourierTransform::new(config.window_size, config.bucket_channels())?;
        let ledger = Ledger::load(&config.ledger_path())?;
        let mut tally = Tally::default();
        for split in Split::ALL {
            let path = config.archive_path(split);
            let mut archive = store::open_store(config.store_mode, &path)?;
            if let Some((name, bucket)) = archive.iter().find(|(_, b)| !transform.accepts(&b.view())) {
                return Err(PrepError::corrupt(
                    &path,
                    format!(
                        "bucket '{}' has shape {:?}, expected window {} and {} channels",
                        name,
                        bucket.dim(),
                        config.window_size,
                        config.bucket_channels()
                    ),
                ));
            }
            archive.map_buckets(&|_, bucket| transform.transform(bucket));
            archive.set_bucket_shape((
                config.window_size,
                config.slices,
                fourier::output_channels(config.bucket_channels()),
            ));
            let staged = store::stage(archive.as_ref(), &path)?;
            store::commit(&staged, &path)?;
            let counts = ledger
                .get(&Ledger::key(split, &config.region))
                .unwrap_or_else(|| count_labels(archive.as_ref()));
            update_summary(report, summarize(split, &path, archive.as_ref(), counts));
            tally.rewritten += 1;
        }
        Ok(tally)
    }
}

/// The region directory is emptied by bucketization; leftovers that are not
/// ride files keep it alive.
fn remove_region_dir(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove {}: {}", dir.display(), err),
    }
}

pub fn count_labels(archive: &dyn BucketStore) -> ClassCount {
    archive
        .iter()
        .fold(ClassCount::default(), |mut counts, (_, bucket)| {
            if bucket::is_positive(bucket) {
                counts.positive += 1;
            } else {
                counts.negative += 1;
            }
            counts
        })
}

fn summarize(split: Split, path: &Path, archive: &dyn BucketStore, counts: ClassCount) -> ArchiveSummary {
    ArchiveSummary {
        split,
        path: path.to_path_buf(),
        buckets: archive.len(),
        shape: archive.iter().next().map(|(_, b): (&str, &Array3<f64>)| b.dim()),
        counts,
    }
}

fn update_summary(report: &mut RunReport, summary: ArchiveSummary) {
    match report.archives.iter_mut().find(|a| a.split == summary.split) {
        Some(existing) => *existing = summary,
        None => report.archives.push(summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_each_ride_applies_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("VM2_{}.csv", i));
                Ride::from_columns(vec![(Column::Timestamp, vec![Some(i as f64)])])
                    .write_csv(&path)
                    .unwrap();
                path
            })
            .collect();
        let tally = for_each_ride(&files, |_, ride| {
            Ok(match ride.get(Column::Timestamp, 0) {
                Some(t) if t == 0.0 => FileOutcome::Delete,
                Some(t) if t == 1.0 => {
                    ride.set_column(Column::Incident, vec![Some(1.0)]);
                    FileOutcome::Rewrite
                }
                _ => FileOutcome::Unchanged,
            })
        })
        .unwrap();
        assert_eq!(
            tally,
            Tally {
                rewritten: 1,
                unchanged: 1,
                deleted: 1
            }
        );
        assert!(!files[0].exists());
        assert_eq!(Ride::read_csv(&files[1]).unwrap().get(Column::Incident, 0), Some(1.0));
    }

    #[test]
    fn failure_aborts_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VM2_1.csv");
        Ride::from_columns(vec![(Column::Timestamp, vec![Some(0.0)])])
            .write_csv(&path)
            .unwrap();
        let result = for_each_ride(&[path.clone()], |p, _| Err(PrepError::corrupt(p, "boom")));
        assert!(matches!(result, Err(PrepError::DataCorruption { .. })));
        assert!(path.exists());
    }

    #[test]
    fn stage_names_are_unique() {
        let mut names: Vec<&str> = Stage::ALL.iter().map(Stage::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Stage::ALL.len());
    }

    #[test]
    fn generative_without_backend_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PrepConfig {
            data_dir: dir.path().to_path_buf(),
            generative: true,
            ..PrepConfig::default()
        };
        assert!(matches!(
            Artifacts::resolve(&config, None),
            Err(PrepError::Configuration(_))
        ));
    }
}
