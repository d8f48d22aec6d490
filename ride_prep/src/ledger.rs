//! Class-count ledger: one CSV column per `<split>_<region>`, positives in
//! the first row and negatives in the second.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{PrepError, Split};

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ClassCount {
    pub positive: u64,
    pub negative: u64,
}

impl ClassCount {
    pub fn total(&self) -> u64 {
        self.positive + self.negative
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ledger {
    entries: Vec<(String, ClassCount)>,
}

impl Ledger {
    pub fn key(split: Split, region: &str) -> String {
        format!("{}_{}", split, region)
    }

    /// Read the ledger; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let csv_err = |message: String| PrepError::Csv {
            path: path.to_path_buf(),
            message,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| csv_err(e.to_string()))?;
        let headers = reader.headers().map_err(|e| csv_err(e.to_string()))?.clone();
        let mut rows: Vec<Vec<u64>> = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| csv_err(e.to_string()))?;
            let row = record
                .iter()
                .map(|cell| parse_count(cell).ok_or_else(|| csv_err(format!("bad count '{}'", cell))))
                .collect::<Result<Vec<u64>, PrepError>>()?;
            rows.push(row);
        }
        if rows.len() < 2 {
            return Err(csv_err(format!("expected 2 count rows, found {}", rows.len())));
        }
        let entries = headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let count = ClassCount {
                    positive: rows[0].get(i).copied().unwrap_or(0),
                    negative: rows[1].get(i).copied().unwrap_or(0),
                };
                (name.to_string(), count)
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<ClassCount> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, c)| *c)
    }

    /// Set a column, keeping its position if it already exists.
    pub fn set(&mut self, key: &str, count: ClassCount) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, c)) => *c = count,
            None => self.entries.push((key.to_string(), count)),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, ClassCount)> + '_ {
        self.entries.iter().map(|(k, c)| (k.as_str(), *c))
    }

    pub fn write(&self, path: &Path) -> Result<(), PrepError> {
        let csv_err = |e: csv::Error| PrepError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        writer
            .write_record(self.entries.iter().map(|(k, _)| k.as_str()))
            .map_err(csv_err)?;
        writer
            .write_record(self.entries.iter().map(|(_, c)| c.positive.to_string()))
            .map_err(csv_err)?;
        writer
            .write_record(self.entries.iter().map(|(_, c)| c.negative.to_string()))
            .map_err(csv_err)?;
        writer.flush().map_err(|e| PrepError::io(path, e))
    }

    /// Write next to `path` for a later rename.
    pub fn stage(&self, path: &Path) -> Result<PathBuf, PrepError> {
        let staged = path.with_extension("csv.tmp");
        self.write(&staged)?;
        Ok(staged)
    }

    pub fn commit(staged: &Path, path: &Path) -> Result<(), PrepError> {
        fs::rename(staged, path).map_err(|e| PrepError::io(path, e))
    }
}

/// Counts written by other tools may carry a trailing `.0`.
fn parse_count(cell: &str) -> Option<u64> {
    cell.parse::<u64>().ok().or_else(|| {
        let v: f64 = cell.parse().ok()?;
        (v >= 0.0 && v.fract() == 0.0).then(|| v as u64)
    })
}
