//! Max-absolute feature scaling, fit once on train and persisted.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ride::{inertial_columns, output_layout, Column, Ride};
use crate::stats::{Applied, TwoPhase};
use crate::PrepError;

/// Fit order of the scaled features: GPS deltas first, then inertial.
pub fn fit_features(lin_acc: bool) -> Vec<Column> {
    let mut cols = vec![Column::Lat, Column::Lon];
    cols.extend(inertial_columns(lin_acc));
    cols
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MaxAbsScaler {
    pub features: Vec<Column>,
    pub max_abs: Vec<f64>,
    pub fitted_at: DateTime<Utc>,
}

impl MaxAbsScaler {
    /// Divisor per feature; features that were all zero pass through.
    pub fn scale(&self) -> Vec<f64> {
        self.max_abs
            .iter()
            .map(|&m| if m == 0.0 { 1.0 } else { m })
            .collect()
    }

    /// Load a previously saved scaler. A missing file is reported as
    /// [`PrepError::MissingArtifact`] so callers can fit a fresh one.
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrepError::MissingArtifact(format!(
                    "no saved scaler at {}",
                    path.display()
                )))
            }
            Err(err) => return Err(PrepError::io(path, err)),
        };
        let scaler: MaxAbsScaler = serde_json::from_str(&text).map_err(|e| PrepError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if scaler.features.len() != scaler.max_abs.len() {
            return Err(PrepError::Json {
                path: path.to_path_buf(),
                message: "feature and max_abs lengths differ".into(),
            });
        }
        Ok(scaler)
    }

    pub fn save(&self, path: &Path) -> Result<(), PrepError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| PrepError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, text).map_err(|e| PrepError::io(path, e))
    }

    /// The scaler must cover exactly the configured feature set.
    pub fn check_layout(&self, lin_acc: bool) -> Result<(), PrepError> {
        let expected = fit_features(lin_acc);
        if self.features != expected {
            return Err(PrepError::Configuration(format!(
                "saved scaler covers {:?}, configuration needs {:?}",
                self.features, expected
            )));
        }
        Ok(())
    }
}

/// Fits [`MaxAbsScaler`] over train rides (missing values count as zero)
/// and rewrites rides in the canonical output layout, timestamp dropped.
#[derive(Clone, Copy, Debug)]
pub struct MaxAbsScaling {
    pub lin_acc: bool,
}

impl TwoPhase for MaxAbsScaling {
    type Partial = Vec<f64>;
    type Params = MaxAbsScaler;

    fn name(&self) -> &'static str {
        "max-abs-scaler"
    }

    fn observe(&self, path: &Path, ride: &Ride) -> Result<Option<Vec<f64>>, PrepError> {
        fit_features(self.lin_acc)
            .into_iter()
            .map(|col| {
                let values = ride.column(col).ok_or_else(|| {
                    PrepError::corrupt(path, format!("missing column '{}'", col.header()))
                })?;
                Ok(values.iter().flatten().fold(0.0_f64, |m, v| m.max(v.abs())))
            })
            .collect::<Result<Vec<f64>, PrepError>>()
            .map(Some)
    }

    fn finish(&self, partials: Vec<Vec<f64>>) -> Result<MaxAbsScaler, String> {
        let features = fit_features(self.lin_acc);
        if partials.is_empty() {
            return Err("no train rides left to fit the scaler".into());
        }
        let mut max_abs = vec![0.0_f64; features.len()];
        for partial in partials {
            for (m, v) in max_abs.iter_mut().zip(partial) {
                *m = m.max(v);
            }
        }
        Ok(MaxAbsScaler {
            features,
            max_abs,
            fitted_at: Utc::now(),
        })
    }

    fn apply(&self, scaler: &MaxAbsScaler, path: &Path, ride: &mut Ride) -> Result<Applied, PrepError> {
        for (&col, scale) in scaler.features.iter().zip(scaler.scale()) {
            let values = ride.column_mut(col).ok_or_else(|| {
                PrepError::corrupt(path, format!("missing column '{}'", col.header()))
            })?;
            for v in values.iter_mut().flatten() {
                *v /= scale;
            }
        }
        let layout = output_layout(self.lin_acc);
        *ride = ride
            .select(&layout)
            .ok_or_else(|| PrepError::corrupt(path, "missing incident column"))?;
        Ok(Applied::Changed)
    }
}
