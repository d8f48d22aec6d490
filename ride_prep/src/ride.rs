//! Column-oriented ride table backed by a header-keyed CSV file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::PrepError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Column {
    Timestamp,
    X,
    Y,
    Z,
    A,
    B,
    C,
    XL,
    YL,
    ZL,
    Acc,
    Lat,
    Lon,
    Incident,
}

pub const ACCELEROMETER: [Column; 3] = [Column::X, Column::Y, Column::Z];
pub const GYROSCOPE: [Column; 3] = [Column::A, Column::B, Column::C];
pub const LINEAR_ACCELERATION: [Column; 3] = [Column::XL, Column::YL, Column::ZL];

impl Column {
    pub const ALL: [Column; 14] = [
        Column::Timestamp,
        Column::X,
        Column::Y,
        Column::Z,
        Column::A,
        Column::B,
        Column::C,
        Column::XL,
        Column::YL,
        Column::ZL,
        Column::Acc,
        Column::Lat,
        Column::Lon,
        Column::Incident,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Column::Timestamp => "timeStamp",
            Column::X => "X",
            Column::Y => "Y",
            Column::Z => "Z",
            Column::A => "a",
            Column::B => "b",
            Column::C => "c",
            Column::XL => "XL",
            Column::YL => "YL",
            Column::ZL => "ZL",
            Column::Acc => "acc",
            Column::Lat => "lat",
            Column::Lon => "lon",
            Column::Incident => "incident",
        }
    }

    pub fn from_header(name: &str) -> Option<Self> {
        let name = name.trim();
        Column::ALL.iter().copied().find(|c| c.header() == name)
    }
}

/// Accelerometer and gyroscope columns, plus linear acceleration when exported.
pub fn inertial_columns(lin_acc: bool) -> Vec<Column> {
    let mut cols: Vec<Column> = ACCELEROMETER.iter().chain(GYROSCOPE.iter()).copied().collect();
    if lin_acc {
        cols.extend_from_slice(&LINEAR_ACCELERATION);
    }
    cols
}

/// Canonical feature order of scaled rides and buckets (label excluded).
pub fn feature_layout(lin_acc: bool) -> Vec<Column> {
    let mut cols = inertial_columns(lin_acc);
    cols.push(Column::Lat);
    cols.push(Column::Lon);
    cols
}

/// Column order of scaled ride files.
pub fn output_layout(lin_acc: bool) -> Vec<Column> {
    let mut cols = feature_layout(lin_acc);
    cols.push(Column::Incident);
    cols
}

/// Recording source, encoded as the trailing character of the file stem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Android,
    Other,
}

impl Device {
    pub fn from_path(path: &Path) -> Self {
        match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if stem.ends_with('a') => Device::Android,
            _ => Device::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ride {
    columns: Vec<Column>,
    values: Vec<Vec<Option<f64>>>,
    rows: usize,
}

impl Ride {
    /// Build a ride from whole columns.
    ///
    /// Panics if the columns differ in length.
    pub fn from_columns(columns: Vec<(Column, Vec<Option<f64>>)>) -> Self {
        let rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        assert!(
            columns.iter().all(|(_, v)| v.len() == rows),
            "ride columns must have equal length"
        );
        let (columns, values): (Vec<Column>, Vec<Vec<Option<f64>>>) =
            columns.into_iter().unzip();
        Self {
            columns,
            values,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn has(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }

    fn position(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|&c| c == column)
    }

    pub fn column(&self, column: Column) -> Option<&[Option<f64>]> {
        self.position(column).map(|i| self.values[i].as_slice())
    }

    pub fn column_mut(&mut self, column: Column) -> Option<&mut Vec<Option<f64>>> {
        self.position(column).map(move |i| &mut self.values[i])
    }

    pub fn get(&self, column: Column, row: usize) -> Option<f64> {
        self.column(column).and_then(|c| c.get(row).copied().flatten())
    }

    /// Timestamps as a dense vector; `None` if the column is absent or has gaps.
    pub fn timestamps(&self) -> Option<Vec<f64>> {
        self.column(Column::Timestamp)?.iter().copied().collect()
    }

    /// Replace a column, appending it if absent.
    pub fn set_column(&mut self, column: Column, values: Vec<Option<f64>>) {
        assert_eq!(values.len(), self.rows, "column length must match ride length");
        match self.position(column) {
            Some(i) => self.values[i] = values,
            None => {
                self.columns.push(column);
                self.values.push(values);
            }
        }
    }

    pub fn drop_column(&mut self, column: Column) {
        if let Some(i) = self.position(column) {
            self.columns.remove(i);
            self.values.remove(i);
        }
    }

    /// A row is complete when every column holds a value.
    pub fn row_complete(&self, row: usize) -> bool {
        self.values.iter().all(|col| col[row].is_some())
    }

    pub fn retain_rows(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.rows);
        for col in &mut self.values {
            let mut idx = 0;
            col.retain(|_| {
                let k = keep[idx];
                idx += 1;
                k
            });
        }
        self.rows = keep.iter().filter(|&&k| k).count();
    }

    /// Rearrange rows so that new row `i` is old row `order[i]`.
    pub fn reorder_rows(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.rows);
        for col in &mut self.values {
            let reordered: Vec<Option<f64>> = order.iter().map(|&i| col[i]).collect();
            *col = reordered;
        }
    }

    /// Project onto `layout`; `None` when a requested column is missing.
    pub fn select(&self, layout: &[Column]) -> Option<Ride> {
        let mut columns = Vec::with_capacity(layout.len());
        for &col in layout {
            columns.push((col, self.column(col)?.to_vec()));
        }
        let mut ride = Ride::from_columns(columns);
        ride.rows = self.rows;
        Some(ride)
    }

    pub fn read_csv(path: &Path) -> Result<Ride, PrepError> {
        let csv_err = |e: csv::Error| PrepError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;
        let headers = reader.headers().map_err(csv_err)?.clone();

        let mut mapping: Vec<Option<usize>> = Vec::with_capacity(headers.len());
        let mut columns: Vec<Column> = Vec::new();
        for name in headers.iter() {
            match Column::from_header(name) {
                Some(col) if !columns.contains(&col) => {
                    mapping.push(Some(columns.len()));
                    columns.push(col);
                }
                Some(_) => {
                    warn!("{}: duplicate column '{}' ignored", path.display(), name);
                    mapping.push(None);
                }
                None => {
                    warn!("{}: unknown column '{}' ignored", path.display(), name);
                    mapping.push(None);
                }
            }
        }

        let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); columns.len()];
        for (row_num, record) in reader.records().enumerate() {
            let record = record.map_err(csv_err)?;
            for (field_idx, slot) in mapping.iter().enumerate() {
                let Some(col_idx) = slot else { continue };
                let raw = record.get(field_idx).unwrap_or("");
                let value = parse_cell(raw).map_err(|_| {
                    PrepError::corrupt(
                        path,
                        format!(
                            "row {}: column '{}' holds non-numeric value '{}'",
                            row_num + 1,
                            columns[*col_idx].header(),
                            raw
                        ),
                    )
                })?;
                values[*col_idx].push(value);
            }
        }

        let rows = values.first().map(Vec::len).unwrap_or(0);
        Ok(Ride {
            columns,
            values,
            rows,
        })
    }

    /// Write the ride through a temporary sibling file, then rename over `path`.
    pub fn write_csv(&self, path: &Path) -> Result<(), PrepError> {
        let tmp = path.with_extension("csv.tmp");
        let csv_err = |e: csv::Error| PrepError::Csv {
            path: tmp.clone(),
            message: e.to_string(),
        };
        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err)?;
            writer
                .write_record(self.columns.iter().map(|c| c.header()))
                .map_err(csv_err)?;
            let mut record: Vec<String> = Vec::with_capacity(self.columns.len());
            for row in 0..self.rows {
                record.clear();
                for (col, values) in self.columns.iter().zip(&self.values) {
                    record.push(format_cell(*col, values[row]));
                }
                writer.write_record(&record).map_err(csv_err)?;
            }
            writer.flush().map_err(|e| PrepError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| PrepError::io(path, e))
    }
}

fn parse_cell(raw: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let v: f64 = raw.parse()?;
    Ok(if v.is_nan() { None } else { Some(v) })
}

fn format_cell(column: Column, value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if column == Column::Timestamp && v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => v.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Ride with the raw export layout: timestamp, X/Y/Z, a/b/c, acc, lat, lon, incident.
    pub(crate) fn raw_ride(rows: &[[Option<f64>; 11]]) -> Ride {
        let layout = [
            Column::Timestamp,
            Column::X,
            Column::Y,
            Column::Z,
            Column::A,
            Column::B,
            Column::C,
            Column::Acc,
            Column::Lat,
            Column::Lon,
            Column::Incident,
        ];
        Ride::from_columns(
            layout
                .iter()
                .enumerate()
                .map(|(i, &c)| (c, rows.iter().map(|r| r[i]).collect()))
                .collect(),
        )
    }

    #[test]
    fn csv_round_trip_keeps_blanks_and_integer_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VM2_1.csv");
        fs::write(
            &path,
            "lat,lon,X,Y,Z,timeStamp,a,b,c,acc,incident,extra\n\
             52.5,13.4,,,,1600000000000,,,,4.0,0,foo\n\
             ,,0.1,-0.2,9.8,1600000000010,0.01,0.02,0.03,,,bar\n",
        )
        .unwrap();
        let ride = Ride::read_csv(&path).unwrap();
        assert_eq!(ride.len(), 2);
        assert!(!ride.columns().iter().any(|c| c.header() == "extra"));
        assert_eq!(ride.get(Column::Lat, 0), Some(52.5));
        assert_eq!(ride.get(Column::Lat, 1), None);
        assert_eq!(ride.get(Column::Z, 1), Some(9.8));

        ride.write_csv(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "lat,lon,X,Y,Z,timeStamp,a,b,c,acc,incident");
        assert!(lines.next().unwrap().contains(",1600000000000,"));
        let again = Ride::read_csv(&path).unwrap();
        assert_eq!(again, ride);
    }

    #[test]
    fn non_numeric_cell_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VM2_1.csv");
        fs::write(&path, "timeStamp,X\n1,abc\n").unwrap();
        assert!(matches!(
            Ride::read_csv(&path),
            Err(PrepError::DataCorruption { .. })
        ));
    }

    #[test]
    fn device_from_trailing_stem_character() {
        assert_eq!(Device::from_path(Path::new("/d/VM2_123a.csv")), Device::Android);
        assert_eq!(Device::from_path(Path::new("/d/VM2_123i.csv")), Device::Other);
    }

    #[test]
    fn retain_and_reorder_rows() {
        let mut ride = Ride::from_columns(vec![
            (Column::Timestamp, vec![Some(3.0), Some(1.0), Some(2.0)]),
            (Column::X, vec![Some(30.0), None, Some(20.0)]),
        ]);
        ride.reorder_rows(&[1, 2, 0]);
        assert_eq!(ride.timestamps().unwrap(), vec![1.0, 2.0, 3.0]);
        ride.retain_rows(&[false, true, true]);
        assert_eq!(ride.len(), 2);
        assert_eq!(ride.column(Column::X).unwrap(), &[Some(20.0), Some(30.0)]);
        assert!(ride.row_complete(0));
    }

    #[test]
    fn select_requires_every_column() {
        let ride = Ride::from_columns(vec![(Column::X, vec![Some(1.0)])]);
        assert!(ride.select(&[Column::X]).is_some());
        assert!(ride.select(&[Column::X, Column::Lat]).is_none());
    }
}
