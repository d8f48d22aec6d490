//! GPS accuracy and velocity outlier filters.

use std::path::Path;

use crate::ride::{Column, Ride};
use crate::stats::{Applied, IqrBounds, TwoPhase};
use crate::PrepError;

/// Blanks the GPS fix on rows whose reported accuracy falls outside the
/// train fence, then drops the accuracy column.
#[derive(Clone, Copy, Debug)]
pub struct AccuracyOutliers {
    pub k: f64,
}

impl TwoPhase for AccuracyOutliers {
    type Partial = Vec<f64>;
    type Params = IqrBounds;

    fn name(&self) -> &'static str {
        "accuracy-outliers"
    }

    fn observe(&self, _path: &Path, ride: &Ride) -> Result<Option<Vec<f64>>, PrepError> {
        let samples: Vec<f64> = ride
            .column(Column::Acc)
            .map(|c| c.iter().flatten().copied().collect())
            .unwrap_or_default();
        Ok(if samples.is_empty() { None } else { Some(samples) })
    }

    fn finish(&self, partials: Vec<Vec<f64>>) -> Result<IqrBounds, String> {
        let samples: Vec<f64> = partials.into_iter().flatten().collect();
        IqrBounds::from_samples(samples, self.k)
            .ok_or_else(|| "no GPS accuracy samples in the train split".to_string())
    }

    fn apply(&self, bounds: &IqrBounds, _path: &Path, ride: &mut Ride) -> Result<Applied, PrepError> {
        let outliers: Vec<usize> = match ride.column(Column::Acc) {
            Some(acc) => (0..acc.len()).filter(|&i| bounds.is_outlier(acc[i])).collect(),
            None => return Ok(Applied::Unchanged),
        };
        for col in [Column::Lat, Column::Lon] {
            if let Some(values) = ride.column_mut(col) {
                for &row in &outliers {
                    values[row] = None;
                }
            }
        }
        ride.drop_column(Column::Acc);
        Ok(Applied::Changed)
    }
}

/// Removes rows whose lat/lon velocity deltas fall outside the per-axis
/// train fence.
#[derive(Clone, Copy, Debug)]
pub struct VelocityOutliers {
    pub k: f64,
}

impl TwoPhase for VelocityOutliers {
    type Partial = Vec<[f64; 2]>;
    type Params = [IqrBounds; 2];

    fn name(&self) -> &'static str {
        "velocity-outliers"
    }

    fn observe(&self, _path: &Path, ride: &Ride) -> Result<Option<Vec<[f64; 2]>>, PrepError> {
        let samples: Vec<[f64; 2]> = (0..ride.len())
            .filter(|&row| ride.row_complete(row))
            .filter_map(|row| Some([ride.get(Column::Lat, row)?, ride.get(Column::Lon, row)?]))
            .collect();
        Ok(if samples.is_empty() { None } else { Some(samples) })
    }

    fn finish(&self, partials: Vec<Vec<[f64; 2]>>) -> Result<[IqrBounds; 2], String> {
        let (lat, lon): (Vec<f64>, Vec<f64>) = partials.into_iter().flatten().map(|[a, b]| (a, b)).unzip();
        let missing = || "no velocity samples in the train split".to_string();
        Ok([
            IqrBounds::from_samples(lat, self.k).ok_or_else(missing)?,
            IqrBounds::from_samples(lon, self.k).ok_or_else(missing)?,
        ])
    }

    fn apply(&self, bounds: &[IqrBounds; 2], _path: &Path, ride: &mut Ride) -> Result<Applied, PrepError> {
        let keep: Vec<bool> = (0..ride.len())
            .map(|row| {
                !(bounds[0].is_outlier(ride.get(Column::Lat, row))
                    || bounds[1].is_outlier(ride.get(Column::Lon, row)))
            })
            .collect();
        if keep.iter().all(|&k| k) {
            return Ok(Applied::Unchanged);
        }
        ride.retain_rows(&keep);
        Ok(Applied::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::tests::raw_ride;
    use crate::stats::{fit, Partition};
    use crate::Split;
    use std::fs;
    use std::path::PathBuf;

    fn row(t: f64, acc: f64, lat: f64) -> [Option<f64>; 11] {
        [
            Some(t),
            Some(0.1),
            Some(0.2),
            Some(9.8),
            Some(0.0),
            Some(0.0),
            Some(0.0),
            Some(acc),
            Some(lat),
            Some(13.0),
            Some(0.0),
        ]
    }

    fn write_rides(dir: &Path, rides: &[(&str, Ride)]) -> Vec<PathBuf> {
        fs::create_dir_all(dir).unwrap();
        rides
            .iter()
            .map(|(name, ride)| {
                let path = dir.join(name);
                ride.write_csv(&path).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn accuracy_outlier_rows_lose_gps() {
        let mut ride = raw_ride(&[row(0.0, 4.0, 52.0), row(1.0, 80.0, 52.1)]);
        let bounds = IqrBounds {
            lower: 0.0,
            upper: 10.0,
        };
        let applied = AccuracyOutliers { k: 1.5 }
            .apply(&bounds, Path::new("r.csv"), &mut ride)
            .unwrap();
        assert_eq!(applied, Applied::Changed);
        assert!(!ride.has(Column::Acc));
        assert_eq!(ride.get(Column::Lat, 0), Some(52.0));
        assert_eq!(ride.get(Column::Lat, 1), None);
        assert_eq!(ride.get(Column::Lon, 1), None);
        assert_eq!(ride.get(Column::X, 1), Some(0.1));
    }

    #[test]
    fn velocity_outlier_rows_are_removed() {
        let mut ride = raw_ride(&[row(0.0, 4.0, 0.5), row(1.0, 4.0, 90.0), row(2.0, 4.0, 0.4)]);
        let bounds = [
            IqrBounds {
                lower: -1.0,
                upper: 1.0,
            },
            IqrBounds {
                lower: -100.0,
                upper: 100.0,
            },
        ];
        let stage = VelocityOutliers { k: 3.0 };
        assert_eq!(
            stage.apply(&bounds, Path::new("r.csv"), &mut ride).unwrap(),
            Applied::Changed
        );
        assert_eq!(ride.timestamps().unwrap(), vec![0.0, 2.0]);
        assert_eq!(
            stage.apply(&bounds, Path::new("r.csv"), &mut ride).unwrap(),
            Applied::Unchanged
        );
    }

    #[test]
    fn bounds_ignore_non_train_data() {
        let root = tempfile::tempdir().unwrap();
        let train_dir = root.path().join("train");
        let test_dir = root.path().join("test");
        let train = write_rides(
            &train_dir,
            &[
                ("VM2_1.csv", raw_ride(&[row(0.0, 3.0, 1.0), row(1.0, 5.0, 1.0)])),
                ("VM2_2.csv", raw_ride(&[row(0.0, 4.0, 1.0), row(1.0, 6.0, 1.0)])),
            ],
        );
        let stage = AccuracyOutliers { k: 1.5 };
        let partition = Partition {
            split: Split::Train,
            dir: &train_dir,
            files: &train,
        };
        let before = fit(&stage, partition).unwrap().params;

        write_rides(
            &test_dir,
            &[("VM2_3.csv", raw_ride(&[row(0.0, 9e9, 1.0), row(1.0, -9e9, 1.0)]))],
        );
        let after = fit(&stage, partition).unwrap().params;
        assert_eq!(before, after);
    }

    #[test]
    fn fitting_on_test_split_is_leakage() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("test");
        let files = write_rides(&dir, &[("VM2_1.csv", raw_ride(&[row(0.0, 3.0, 1.0)]))]);
        let err = fit(
            &AccuracyOutliers { k: 1.5 },
            Partition {
                split: Split::Test,
                dir: &dir,
                files: &files,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PrepError::Leakage { split: Split::Test, .. }));
        assert!(files[0].exists());
    }

    #[test]
    fn train_rides_without_accuracy_are_discarded() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("train");
        let mut no_acc = raw_ride(&[row(0.0, 3.0, 1.0)]);
        no_acc.set_column(Column::Acc, vec![None]);
        let files = write_rides(
            &dir,
            &[
                ("VM2_1.csv", raw_ride(&[row(0.0, 3.0, 1.0)])),
                ("VM2_2.csv", no_acc),
            ],
        );
        let fitted = fit(
            &AccuracyOutliers { k: 1.5 },
            Partition {
                split: Split::Train,
                dir: &dir,
                files: &files,
            },
        )
        .unwrap();
        assert_eq!(fitted.observed, 1);
        assert_eq!(fitted.discarded, vec![files[1].clone()]);
        assert!(!files[1].exists());
    }

    #[test]
    fn empty_train_statistic_is_corruption() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("train");
        fs::create_dir_all(&dir).unwrap();
        let err = fit(
            &VelocityOutliers { k: 3.0 },
            Partition {
                split: Split::Train,
                dir: &dir,
                files: &[],
            },
        )
        .unwrap_err();
        assert!(matches!(err, PrepError::DataCorruption { .. }));
    }
}
