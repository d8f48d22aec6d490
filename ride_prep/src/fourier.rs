//! Discrete Fourier transform of the inertial channels of a bucket along
//! its window axis.

use std::fmt;
use std::sync::Arc;

use ndarray::{s, Array3, ArrayView3, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::PrepError;

/// Channels after the inertial block: lat, lon, label.
const TRAILING: usize = 3;

/// Channel count of a transformed bucket.
pub fn output_channels(channels: usize) -> usize {
    2 * (channels - TRAILING) + TRAILING
}

pub struct FourierTransform {
    window: usize,
    channels: usize,
    fft: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for FourierTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FourierTransform")
            .field("window", &self.window)
            .field("channels", &self.channels)
            .finish()
    }
}

impl FourierTransform {
    /// Plan a transform for buckets of `window` rows and `channels` channels.
    pub fn new(window: usize, channels: usize) -> Result<Self, PrepError> {
        if window == 0 || channels <= TRAILING {
            return Err(PrepError::Configuration(format!(
                "cannot transform buckets with window {} and {} channels",
                window, channels
            )));
        }
        let fft = FftPlanner::new().plan_fft_forward(window);
        Ok(Self {
            window,
            channels,
            fft,
        })
    }

    pub fn accepts(&self, bucket: &ArrayView3<'_, f64>) -> bool {
        bucket.len_of(Axis(0)) == self.window && bucket.len_of(Axis(2)) == self.channels
    }

    /// `[window, slices, channels]` to `[window, slices, 2·inertial + 3]`:
    /// real parts, imaginary parts, then lat, lon and label copied as is.
    pub fn transform(&self, bucket: ArrayView3<'_, f64>) -> Array3<f64> {
        debug_assert!(self.accepts(&bucket));
        let (window, slices, channels) = bucket.dim();
        let inertial = channels - TRAILING;
        let mut out = Array3::zeros((window, slices, output_channels(channels)));
        let mut buf = vec![Complex64::new(0.0, 0.0); window];

        for slice in 0..slices {
            for ch in 0..inertial {
                for (w, cell) in buf.iter_mut().enumerate() {
                    *cell = Complex64::new(bucket[[w, slice, ch]], 0.0);
                }
                self.fft.process(&mut buf);
                for (w, cell) in buf.iter().enumerate() {
                    out[[w, slice, ch]] = cell.re;
                    out[[w, slice, inertial + ch]] = cell.im;
                }
            }
        }
        out.slice_mut(s![.., .., 2 * inertial..])
            .assign(&bucket.slice(s![.., .., inertial..]));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_bucket(seed: u64) -> Array3<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bucket = Array3::from_shape_fn((5, 20, 9), |_| rng.gen_range(-1.0..1.0));
        bucket.index_axis_mut(Axis(2), 8).fill(1.0);
        bucket
    }

    #[test]
    fn output_shape() {
        let t = FourierTransform::new(5, 9).unwrap();
        let out = t.transform(random_bucket(1).view());
        assert_eq!(out.dim(), (5, 20, 15));
        assert_eq!(output_channels(12), 21);
    }

    #[test]
    fn inverse_reconstructs_inertial_channels() {
        let bucket = random_bucket(2);
        let out = FourierTransform::new(5, 9).unwrap().transform(bucket.view());
        let inverse = FftPlanner::<f64>::new().plan_fft_inverse(5);
        for slice in 0..20 {
            for ch in 0..6 {
                let mut buf: Vec<Complex64> = (0..5)
                    .map(|w| Complex64::new(out[[w, slice, ch]], out[[w, slice, 6 + ch]]))
                    .collect();
                inverse.process(&mut buf);
                for (w, v) in buf.iter().enumerate() {
                    assert_abs_diff_eq!(v.re / 5.0, bucket[[w, slice, ch]], epsilon = 1e-12);
                    assert_abs_diff_eq!(v.im / 5.0, 0.0, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn gps_and_label_are_copied_exactly() {
        let bucket = random_bucket(3);
        let out = FourierTransform::new(5, 9).unwrap().transform(bucket.view());
        for (src, dst) in [(6, 12), (7, 13), (8, 14)] {
            let a = bucket.index_axis(Axis(2), src);
            let b = out.index_axis(Axis(2), dst);
            assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn constant_signal_has_only_dc() {
        let mut bucket = Array3::zeros((5, 1, 4));
        bucket.slice_mut(s![.., .., 0]).fill(2.0);
        let out = FourierTransform::new(5, 4).unwrap().transform(bucket.view());
        assert_abs_diff_eq!(out[[0, 0, 0]], 10.0, epsilon = 1e-12);
        for w in 1..5 {
            assert_abs_diff_eq!(out[[w, 0, 0]], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn too_few_channels_is_rejected() {
        assert!(FourierTransform::new(5, 3).is_err());
    }
}
