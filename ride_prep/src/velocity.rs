//! Converts absolute GPS positions to per-second deltas.

use crate::ride::{Column, Ride};

/// Replace lat/lon by their change per second between consecutive GPS
/// fixes. The first fix and rows without a fix end up empty, and so does a
/// fix sharing its timestamp with the previous one. Returns the number of
/// deltas produced.
pub fn to_velocity_deltas(ride: &mut Ride) -> usize {
    let (Some(ts), Some(lat), Some(lon)) = (
        ride.column(Column::Timestamp),
        ride.column(Column::Lat),
        ride.column(Column::Lon),
    ) else {
        return 0;
    };

    let mut lat_delta = vec![None; ride.len()];
    let mut lon_delta = vec![None; ride.len()];
    let mut previous: Option<(f64, f64, f64)> = None;
    let mut produced = 0;
    for row in 0..ride.len() {
        let (Some(t), Some(la), Some(lo)) = (ts[row], lat[row], lon[row]) else {
            continue;
        };
        if let Some((pt, pla, plo)) = previous {
            let dt = t - pt;
            if dt != 0.0 {
                lat_delta[row] = Some((la - pla) * 1000.0 / dt);
                lon_delta[row] = Some((lo - plo) * 1000.0 / dt);
                produced += 1;
            }
        }
        previous = Some((t, la, lo));
    }

    ride.set_column(Column::Lat, lat_delta);
    ride.set_column(Column::Lon, lon_delta);
    produced
}
