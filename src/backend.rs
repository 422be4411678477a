//! Compute backends for the Richardson-Lucy solver.
//!
//! The solver only needs forward and inverse 3D Fourier transforms on complex volumes. The
//! backend is handed to the solver at construction, so where the transforms run is a
//! configuration decision and never a global side effect.

use ndarray::{Array3, ArrayView3, Axis, Zip};
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Array and FFT primitives the solver is written against.
pub trait ComputeBackend: Send + Sync {
    /// In-place unnormalized forward 3D FFT.
    fn fft3(&self, data: &mut Array3<Complex32>);

    /// In-place inverse 3D FFT, normalized by the number of elements.
    fn ifft3(&self, data: &mut Array3<Complex32>);

    fn name(&self) -> &str;

    /// Forward transform of a real volume.
    fn rfft3(&self, data: ArrayView3<f32>) -> Array3<Complex32> {
        let mut spectrum = data.mapv(|v| Complex32::new(v, 0.0));
        self.fft3(&mut spectrum);
        spectrum
    }

    /// Inverse transform of a spectrum, keeping the real part.
    fn irfft3(&self, spectrum: &Array3<Complex32>) -> Array3<f32> {
        let mut data = spectrum.clone();
        self.ifft3(&mut data);
        data.mapv(|c| c.re)
    }
}

/// CPU implementation built from 1D `rustfft` transforms along each axis.
///
/// Plans are cached per length and direction; lanes of one axis are transformed in parallel.
#[derive(Default)]
pub struct CpuBackend {
    plans: Mutex<HashMap<(usize, bool), Arc<dyn Fft<f32>>>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn plan(&self, len: usize, inverse: bool) -> Arc<dyn Fft<f32>> {
        let mut plans = match self.plans.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        plans
            .entry((len, inverse))
            .or_insert_with(|| {
                let mut planner = FftPlanner::new();
                if inverse {
                    planner.plan_fft_inverse(len)
                } else {
                    planner.plan_fft_forward(len)
                }
            })
            .clone()
    }

    fn transform(&self, data: &mut Array3<Complex32>, inverse: bool) {
        for axis in 0..3 {
            let len = data.len_of(Axis(axis));
            if len < 2 {
                continue;
            }
            let fft = self.plan(len, inverse);
            Zip::from(data.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
                let mut buffer: Vec<Complex32> = lane.to_vec();
                fft.process(&mut buffer);
                for (dst, src) in lane.iter_mut().zip(buffer) {
                    *dst = src;
                }
            });
        }
    }
}

impl ComputeBackend for CpuBackend {
    fn fft3(&self, data: &mut Array3<Complex32>) {
        self.transform(data, false);
    }

    fn ifft3(&self, data: &mut Array3<Complex32>) {
        self.transform(data, true);
        let scale = 1.0 / data.len().max(1) as f32;
        data.mapv_inplace(|c| c * scale);
    }

    fn name(&self) -> &str {
        "cpu (rustfft)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn fft_round_trip_restores_input() {
        let backend = CpuBackend::new();
        let input = Array3::from_shape_fn((4, 6, 5), |(z, y, x)| {
            ((z * 31 + y * 7 + x * 3) % 11) as f32 - 4.0
        });
        let spectrum = backend.rfft3(input.view());
        let restored = backend.irfft3(&spectrum);
        for (a, b) in input.iter().zip(restored.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn impulse_at_origin_has_flat_spectrum() {
        let backend = CpuBackend::new();
        let mut impulse = Array3::<f32>::zeros((4, 4, 8));
        impulse[[0, 0, 0]] = 1.0;
        let spectrum = backend.rfft3(impulse.view());
        for c in spectrum.iter() {
            assert_abs_diff_eq!(c.re, 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(c.im, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn dc_term_is_the_sum() {
        let backend = CpuBackend::new();
        let data = Array3::<f32>::from_elem((3, 5, 2), 2.0);
        let spectrum = backend.rfft3(data.view());
        assert_abs_diff_eq!(spectrum[[0, 0, 0]].re, 60.0, epsilon = 1e-4);
        assert_abs_diff_eq!(spectrum[[1, 2, 1]].norm(), 0.0, epsilon = 1e-4);
    }
}
