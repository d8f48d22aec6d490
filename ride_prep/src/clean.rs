//! Per-ride cleaning steps: ordering, validity, cross-sensor blanking and
//! incomplete-row removal.

use ordered_float::OrderedFloat;

use crate::ride::{inertial_columns, Column, Ride};

/// Stable sort by timestamp. Rows without a timestamp go last.
pub fn sort_by_timestamp(ride: &mut Ride) {
    let Some(ts) = ride.column(Column::Timestamp) else {
        return;
    };
    let key = |i: usize| match ts[i] {
        Some(t) => (false, OrderedFloat(t)),
        None => (true, OrderedFloat(0.0)),
    };
    let mut order: Vec<usize> = (0..ride.len()).collect();
    if order.windows(2).all(|w| key(w[0]) <= key(w[1])) {
        return;
    }
    order.sort_by_key(|&i| key(i));
    ride.reorder_rows(&order);
}

pub fn is_sorted(ride: &Ride) -> bool {
    match ride.timestamps() {
        Some(ts) => ts.windows(2).all(|w| w[0] <= w[1]),
        None => false,
    }
}

/// Why a ride is unusable, if it is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Invalid {
    /// Two adjacent rows are further apart than the allowed gap.
    Gap { at_row: usize, gap_ms: f64 },
    /// No row past the first carries every field.
    NoCompleteRows,
}

/// Check a sorted ride for sensor dropouts and for the absence of any
/// complete row. The first row never counts as complete since its gap is
/// undefined.
pub fn check_ride(ride: &Ride, max_gap_ms: f64) -> Result<(), Invalid> {
    let ts = ride.column(Column::Timestamp).unwrap_or(&[]);
    let mut any_complete = false;
    for row in 1..ride.len() {
        let gap = match (ts.get(row - 1).copied().flatten(), ts.get(row).copied().flatten()) {
            (Some(prev), Some(cur)) => Some(cur - prev),
            _ => None,
        };
        if let Some(gap_ms) = gap {
            if gap_ms > max_gap_ms {
                return Err(Invalid::Gap {
                    at_row: row,
                    gap_ms,
                });
            }
            if !any_complete && ride.row_complete(row) {
                any_complete = true;
            }
        }
    }
    if any_complete {
        Ok(())
    } else {
        Err(Invalid::NoCompleteRows)
    }
}

/// Blank inertial readings on rows that carry a GPS fix. Those rows share a
/// second-rounded timestamp on Android exports, so their sensor values cannot
/// be placed in time. Returns the number of rows touched.
pub fn blank_inertial_on_gps_rows(ride: &mut Ride, lin_acc: bool) -> usize {
    let gps_rows: Vec<usize> = (0..ride.len())
        .filter(|&row| {
            [Column::Lat, Column::Lon, Column::Acc]
                .iter()
                .all(|&c| ride.get(c, row).is_some())
        })
        .collect();
    if gps_rows.is_empty() {
        return 0;
    }
    for col in inertial_columns(lin_acc) {
        if let Some(values) = ride.column_mut(col) {
            for &row in &gps_rows {
                values[row] = None;
            }
        }
    }
    gps_rows.len()
}

/// Drop rows with any empty field. Returns the number of rows removed.
pub fn drop_incomplete_rows(ride: &mut Ride) -> usize {
    let keep: Vec<bool> = (0..ride.len()).map(|row| ride.row_complete(row)).collect();
    let removed = keep.iter().filter(|&&k| !k).count();
    if removed > 0 {
        ride.retain_rows(&keep);
    }
    removed
}
