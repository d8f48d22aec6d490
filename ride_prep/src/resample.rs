//! Resampling rides onto a deduplicated or an equidistant time base.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ride::{Column, Device, Ride, ACCELEROMETER, GYROSCOPE, LINEAR_ACCELERATION};

/// Channels interpolated in time. Linear acceleration is only exported by
/// Android devices.
pub fn interpolated_columns(device: Device, lin_acc: bool) -> Vec<Column> {
    let mut cols: Vec<Column> = ACCELEROMETER.iter().chain(GYROSCOPE.iter()).copied().collect();
    if lin_acc && device == Device::Android {
        cols.extend_from_slice(&LINEAR_ACCELERATION);
    }
    cols
}

/// Fill interior gaps linearly in elapsed time and trailing gaps with the
/// last value. Leading gaps stay empty.
pub fn interpolate_time(times: &[f64], values: &mut [Option<f64>]) {
    let mut last: Option<usize> = None;
    for i in 0..values.len() {
        if values[i].is_none() {
            continue;
        }
        if let Some(a) = last {
            if i > a + 1 {
                let (ta, va) = (times[a], values[a].unwrap_or_default());
                let (tb, vb) = (times[i], values[i].unwrap_or_default());
                let span = tb - ta;
                for j in a + 1..i {
                    let frac = if span > 0.0 { (times[j] - ta) / span } else { 0.0 };
                    values[j] = Some(va + (vb - va) * frac);
                }
            }
        }
        last = Some(i);
    }
    if let Some(a) = last {
        let fill = values[a];
        for v in values.iter_mut().skip(a + 1) {
            *v = fill;
        }
    }
}

/// Fill each gap with the next available value.
pub fn backfill(values: &mut [Option<f64>]) {
    let mut next = None;
    for v in values.iter_mut().rev() {
        match v {
            Some(x) => next = Some(*x),
            None => *v = next,
        }
    }
}

/// Fill each gap with the previous available value.
pub fn forward_fill(values: &mut [Option<f64>]) {
    let mut prev = None;
    for v in values.iter_mut() {
        match v {
            Some(x) => prev = Some(*x),
            None => *v = prev,
        }
    }
}

/// Drop rows repeating the previous timestamp. The ride must be sorted.
/// The first row of each group is kept and carries the group's highest
/// incident label.
fn dedup_timestamps(ride: &mut Ride, ts: &[f64]) -> usize {
    let keep: Vec<bool> = (0..ts.len()).map(|i| i == 0 || ts[i] != ts[i - 1]).collect();
    let dropped = keep.iter().filter(|&&k| !k).count();
    if dropped == 0 {
        return 0;
    }
    if let Some(labels) = ride.column_mut(Column::Incident) {
        let mut head = 0;
        for i in 1..labels.len() {
            if keep[i] {
                head = i;
            } else if let Some(v) = labels[i] {
                labels[head] = Some(labels[head].map_or(v, |h| h.max(v)));
            }
        }
    }
    ride.retain_rows(&keep);
    dropped
}

/// Keep the original timestamps, interpolate inertial channels in time and
/// pad the GPS deltas backward then forward.
pub fn linear(ride: &mut Ride, inertial: &[Column]) -> Result<(), String> {
    let ts = ride.timestamps().ok_or("row without timestamp")?;
    dedup_timestamps(ride, &ts);
    let ts = ride.timestamps().ok_or("row without timestamp")?;

    for &col in inertial {
        if let Some(values) = ride.column_mut(col) {
            interpolate_time(&ts, values);
        }
    }
    for col in [Column::Lat, Column::Lon] {
        if let Some(values) = ride.column_mut(col) {
            backfill(values);
            forward_fill(values);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentAssignment {
    /// Timestamp of the original incident row.
    pub source_ms: i64,
    /// Grid timestamp now carrying the incident.
    pub assigned_ms: i64,
    /// Every free grid row was taken, so the label is OR-ed into a row
    /// already carrying another incident.
    pub shared: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EquidistantSummary {
    pub grid_rows: usize,
    pub inserted: usize,
    pub removed: usize,
    pub assignments: Vec<IncidentAssignment>,
    pub dropped_incidents: usize,
}

/// Reindex onto `start, start + interval, ..` (strictly before the last
/// original timestamp), with `start` the first timestamp floored to the
/// interval.
///
/// Original rows are kept while the inertial channels are interpolated, then
/// every original row off the grid is removed. Each original incident is moved
/// to its nearest grid row not yet claimed by another incident (ties go to
/// the later row). Off-grid candidates met during that search are consumed.
/// The incident column comes out binary.
pub fn equidistant(
    ride: &mut Ride,
    interval_ms: i64,
    inertial: &[Column],
) -> Result<EquidistantSummary, String> {
    if interval_ms <= 0 {
        return Err(format!("time interval must be positive, got {}", interval_ms));
    }
    let ts = ride.timestamps().ok_or("row without timestamp")?;
    if ts.is_empty() {
        return Ok(EquidistantSummary::default());
    }
    dedup_timestamps(ride, &ts);
    let original: Vec<i64> = ride
        .timestamps()
        .ok_or("row without timestamp")?
        .iter()
        .map(|t| t.round() as i64)
        .collect();

    let start = original[0].div_euclid(interval_ms) * interval_ms;
    let end = original[original.len() - 1];
    let on_grid_ts = |t: i64| t >= start && t < end && (t - start) % interval_ms == 0;
    let grid_len = if end > start {
        ((end - start - 1) / interval_ms + 1) as usize
    } else {
        0
    };

    // Merge original rows and net-new grid timestamps in time order.
    let mut merged: Vec<(i64, Option<usize>)> = Vec::with_capacity(original.len() + grid_len);
    let mut oi = 0;
    for k in 0..grid_len {
        let g = start + k as i64 * interval_ms;
        while oi < original.len() && original[oi] < g {
            merged.push((original[oi], Some(oi)));
            oi += 1;
        }
        if oi < original.len() && original[oi] == g {
            continue;
        }
        merged.push((g, None));
    }
    merged.extend(original[oi..].iter().enumerate().map(|(k, &t)| (t, Some(oi + k))));

    let times: Vec<f64> = merged.iter().map(|&(t, _)| t as f64).collect();
    let on_grid: Vec<bool> = merged.iter().map(|&(t, _)| on_grid_ts(t)).collect();
    let inserted = merged.iter().filter(|(_, src)| src.is_none()).count();

    let columns: Vec<(Column, Vec<Option<f64>>)> = ride
        .columns()
        .iter()
        .map(|&col| {
            let Some(source) = ride.column(col) else {
                return (col, vec![None; merged.len()]);
            };
            let values = merged
                .iter()
                .map(|&(t, src)| match (col, src) {
                    (Column::Timestamp, _) => Some(t as f64),
                    (_, Some(i)) => source[i],
                    (_, None) => None,
                })
                .collect();
            (col, values)
        })
        .collect();
    let mut resampled = Ride::from_columns(columns);

    for &col in inertial {
        if let Some(values) = resampled.column_mut(col) {
            interpolate_time(&times, values);
        }
    }
    for col in [Column::Lat, Column::Lon] {
        if let Some(values) = resampled.column_mut(col) {
            backfill(values);
        }
    }

    let incidents: Vec<usize> = resampled
        .column(Column::Incident)
        .map(|c| (0..c.len()).filter(|&i| c[i].map_or(false, |v| v > 0.0)).collect())
        .unwrap_or_default();

    let mut consumed = vec![false; merged.len()];
    let mut claimed = vec![false; merged.len()];
    let mut assignments = Vec::with_capacity(incidents.len());
    let mut dropped_incidents = 0;
    for &row in &incidents {
        let target = times[row];
        let free = nearest_grid_row(&times, target, &on_grid, &mut consumed, Some(&claimed));
        let (idx, shared) = match free {
            Some(idx) => (Some(idx), false),
            None => (
                nearest_grid_row(&times, target, &on_grid, &mut consumed, None),
                true,
            ),
        };
        match idx {
            Some(idx) => {
                claimed[idx] = true;
                assignments.push(IncidentAssignment {
                    source_ms: merged[row].0,
                    assigned_ms: merged[idx].0,
                    shared,
                });
            }
            None => dropped_incidents += 1,
        }
    }
    if dropped_incidents > 0 {
        warn!("{} incidents lost: no grid row survives", dropped_incidents);
    }

    if resampled.has(Column::Incident) {
        let labels = claimed
            .iter()
            .map(|&c| Some(if c { 1.0 } else { 0.0 }))
            .collect();
        resampled.set_column(Column::Incident, labels);
    }

    let removed = on_grid.iter().filter(|&&g| !g).count();
    resampled.retain_rows(&on_grid);
    *ride = resampled;

    Ok(EquidistantSummary {
        grid_rows: grid_len,
        inserted,
        removed,
        assignments,
        dropped_incidents,
    })
}

/// Walk outward from `target` in order of distance, later row first on ties.
/// Off-grid rows are marked consumed and skipped; with `claimed` given, rows
/// already carrying an incident are skipped too.
fn nearest_grid_row(
    times: &[f64],
    target: f64,
    on_grid: &[bool],
    consumed: &mut [bool],
    claimed: Option<&[bool]>,
) -> Option<usize> {
    let n = times.len();
    let mut right = times.partition_point(|&t| t < target);
    let mut left = right;
    loop {
        let left_dist = (left > 0).then(|| target - times[left - 1]);
        let right_dist = (right < n).then(|| times[right] - target);
        let idx = match (left_dist, right_dist) {
            (Some(l), Some(r)) if l < r => {
                left -= 1;
                left
            }
            (Some(_), None) => {
                left -= 1;
                left
            }
            (_, Some(_)) => {
                right += 1;
                right - 1
            }
            (None, None) => return None,
        };
        if consumed[idx] {
            continue;
        }
        if !on_grid[idx] {
            consumed[idx] = true;
            continue;
        }
        if claimed.map_or(false, |c| c[idx]) {
            continue;
        }
        return Some(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ride(ts: &[f64], x: &[Option<f64>], lat: &[Option<f64>], incident: &[f64]) -> Ride {
        Ride::from_columns(vec![
            (Column::Timestamp, ts.iter().map(|&t| Some(t)).collect()),
            (Column::X, x.to_vec()),
            (Column::Lat, lat.to_vec()),
            (Column::Lon, lat.to_vec()),
            (Column::Incident, incident.iter().map(|&v| Some(v)).collect()),
        ])
    }

    fn on_grid(t: i64, start: i64, interval: i64) -> bool {
        t >= start && (t - start) % interval == 0
    }

    #[test]
    fn time_interpolation_weights_by_elapsed_time() {
        let times = [0.0, 10.0, 40.0, 50.0, 60.0];
        let mut values = [None, Some(0.0), None, Some(4.0), None];
        interpolate_time(&times, &mut values);
        assert_eq!(values[0], None);
        assert_relative_eq!(values[2].unwrap(), 3.0);
        assert_eq!(values[4], Some(4.0));
    }

    #[test]
    fn duplicate_timestamp_keeps_incident_in_linear_mode() {
        let mut r = ride(
            &[1000.0, 1050.0, 1050.0, 1300.0],
            &[Some(0.0); 4],
            &[Some(1.0); 4],
            &[0.0, 0.0, 1.0, 0.0],
        );
        linear(&mut r, &[Column::X]).unwrap();
        assert_eq!(r.timestamps().unwrap(), vec![1000.0, 1050.0, 1300.0]);
        assert_eq!(
            r.column(Column::Incident).unwrap(),
            &[Some(0.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn duplicate_timestamp_keeps_incident_on_grid() {
        let mut r = ride(
            &[1000.0, 1050.0, 1050.0, 1300.0],
            &[Some(0.0); 4],
            &[Some(1.0); 4],
            &[0.0, 0.0, 1.0, 0.0],
        );
        let summary = equidistant(&mut r, 100, &[Column::X]).unwrap();
        assert_eq!(summary.dropped_incidents, 0);
        assert_eq!(summary.assignments.len(), 1);
        assert_eq!(summary.assignments[0].source_ms, 1050);
        assert_eq!(summary.assignments[0].assigned_ms, 1100);
        let labels = r.column(Column::Incident).unwrap();
        assert_eq!(labels.iter().filter(|v| **v == Some(1.0)).count(), 1);
    }

    #[test]
    fn fills_in_both_directions() {
        let mut v = [None, Some(1.0), None, Some(2.0), None];
        backfill(&mut v);
        assert_eq!(v, [Some(1.0), Some(1.0), Some(2.0), Some(2.0), None]);
        forward_fill(&mut v);
        assert_eq!(v[4], Some(2.0));
    }

    #[test]
    fn linear_dedups_and_pads_gps() {
        let mut r = ride(
            &[0.0, 10.0, 10.0, 20.0, 30.0],
            &[Some(0.0), None, Some(9.0), Some(2.0), None],
            &[None, Some(5.0), None, None, Some(7.0)],
            &[0.0; 5],
        );
        linear(&mut r, &[Column::X]).unwrap();
        assert_eq!(r.timestamps().unwrap(), vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(
            r.column(Column::X).unwrap(),
            &[Some(0.0), Some(1.0), Some(2.0), Some(2.0)]
        );
        assert_eq!(
            r.column(Column::Lat).unwrap(),
            &[Some(5.0), Some(5.0), Some(7.0), Some(7.0)]
        );
    }

    #[test]
    fn equidistant_grid_floors_start_and_excludes_end() {
        let mut r = ride(
            &[1030.0, 1100.0, 1170.0, 1400.0],
            &[Some(0.0), Some(1.0), Some(2.0), Some(5.0)],
            &[None, Some(3.0), None, Some(4.0)],
            &[0.0; 4],
        );
        let summary = equidistant(&mut r, 100, &[Column::X]).unwrap();
        assert_eq!(r.timestamps().unwrap(), vec![1000.0, 1100.0, 1200.0, 1300.0]);
        assert_eq!(summary.grid_rows, 4);
        assert_eq!(summary.inserted, 3);
        let x = r.column(Column::X).unwrap();
        assert_eq!(x[0], None);
        assert_eq!(x[1], Some(1.0));
        assert_relative_eq!(x[2].unwrap(), 2.0 + 3.0 * 30.0 / 230.0);
        assert_eq!(r.column(Column::Lat).unwrap()[0], Some(3.0));
        assert_eq!(r.column(Column::Lat).unwrap()[2], Some(4.0));
        assert!(r.column(Column::Incident).unwrap().iter().all(|v| *v == Some(0.0)));
    }

    #[test]
    fn incident_moves_to_nearest_surviving_row() {
        let mut r = ride(
            &[1000.0, 1040.0, 1090.0, 1300.0],
            &[Some(0.0); 4],
            &[Some(1.0); 4],
            &[0.0, 0.0, 1.0, 0.0],
        );
        let summary = equidistant(&mut r, 100, &[Column::X]).unwrap();
        assert_eq!(summary.assignments.len(), 1);
        let a = summary.assignments[0];
        assert_eq!((a.source_ms, a.assigned_ms, a.shared), (1090, 1100, false));
        let ts = r.timestamps().unwrap();
        let labels = r.column(Column::Incident).unwrap();
        let hit = ts.iter().position(|&t| t == 1100.0).unwrap();
        assert_eq!(labels[hit], Some(1.0));
        assert_eq!(labels.iter().filter(|v| **v == Some(1.0)).count(), 1);
    }

    #[test]
    fn neighbouring_incidents_claim_distinct_rows() {
        let mut r = ride(
            &[1000.0, 1090.0, 1110.0, 1500.0],
            &[Some(0.0); 4],
            &[Some(1.0); 4],
            &[0.0, 1.0, 1.0, 0.0],
        );
        let summary = equidistant(&mut r, 100, &[Column::X]).unwrap();
        let assigned: Vec<i64> = summary.assignments.iter().map(|a| a.assigned_ms).collect();
        assert_eq!(assigned, vec![1100, 1200]);
        assert!(summary.assignments.iter().all(|a| !a.shared));
    }

    #[test]
    fn collision_is_or_combined_when_grid_is_exhausted() {
        let mut r = ride(
            &[1000.0, 1010.0, 1020.0, 1100.0],
            &[Some(0.0); 4],
            &[Some(1.0); 4],
            &[1.0, 1.0, 1.0, 0.0],
        );
        let summary = equidistant(&mut r, 100, &[Column::X]).unwrap();
        assert_eq!(r.timestamps().unwrap(), vec![1000.0]);
        assert_eq!(summary.assignments.len(), 3);
        assert!(!summary.assignments[0].shared);
        assert!(summary.assignments[1].shared && summary.assignments[2].shared);
        assert_eq!(r.column(Column::Incident).unwrap(), &[Some(1.0)]);
    }

    #[test]
    fn assignments_never_land_on_removed_rows() {
        let interval = 100;
        // Dense, jittered fixture: originals overlap the grid on every 5th row.
        let mut ts = Vec::new();
        let mut incident = Vec::new();
        for i in 0..200i64 {
            let t = 5_000 + i * 37 + if i % 5 == 0 { 0 } else { i % 7 };
            ts.push(t as f64);
            incident.push(if i % 11 == 3 || i % 13 == 0 { 1.0 } else { 0.0 });
        }
        ts.sort_by(|a, b| a.total_cmp(b));
        let n = ts.len();
        let mut r = ride(&ts, &vec![Some(1.0); n], &vec![Some(0.5); n], &incident);
        let expected = incident.iter().filter(|&&v| v > 0.0).count();

        let summary = equidistant(&mut r, interval, &[Column::X]).unwrap();
        let start = 5_000;
        let surviving: Vec<i64> = r.timestamps().unwrap().iter().map(|&t| t as i64).collect();

        assert_eq!(summary.assignments.len() + summary.dropped_incidents, expected);
        assert_eq!(summary.dropped_incidents, 0);
        for a in &summary.assignments {
            assert!(on_grid(a.assigned_ms, start, interval));
            assert!(surviving.contains(&a.assigned_ms));
        }
        let mut distinct: Vec<i64> = summary
            .assignments
            .iter()
            .filter(|a| !a.shared)
            .map(|a| a.assigned_ms)
            .collect();
        let before = distinct.len();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), before);
        assert!(surviving.iter().all(|&t| on_grid(t, start, interval)));
        let positives = r
            .column(Column::Incident)
            .unwrap()
            .iter()
            .filter(|v| **v == Some(1.0))
            .count();
        assert_eq!(positives, distinct.len());
    }
}
