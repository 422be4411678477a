//! This module implements the Richardson-Lucy solver used to restore a single 3D slice.
//!
//! Two interchangeable variants are available, selected by [`SolverConfig::use_otf`]:
//!
//! * **Direct**: the classic multiplicative update
//!   `estimate *= correlate(observed / convolve(estimate, kernel), kernel)`, with reflected
//!   padding at the borders. The iteration count is authoritative.
//! * **OTF**: an update carried out on the Fourier transform of the estimate, with optional
//!   regularization, spherical low-pass cutoff of the transfer function and early stopping
//!   once the change between iterations has dropped below a fraction of the first change.
//!
//! Convolutions are circular products in the frequency domain, so the kernel is moved to the
//! array origin before transforming it.

use crate::backend::ComputeBackend;
use crate::config::SolverConfig;
use crate::error::{DeconError, Result};
use crate::filters::background::{complete_background, BackgroundStats};
use crate::filters::psf::Kernel;
use crate::math_tools::{crop3, mean_squared_difference, pad_reflect3};
use ndarray::{Array3, ArrayView3, Zip};
use num_complex::Complex32;
use num_traits::Zero;
use rand::Rng;
use std::sync::Arc;

/// Transfer function of one kernel, prepared for volumes of one shape.
///
/// Preparing is the expensive, shape-dependent part of a solve; a prepared transfer function
/// is immutable and can be shared across all timepoints of a channel.
#[derive(Clone, Debug)]
pub struct TransferFunction {
    shape: (usize, usize, usize),
    otf: Array3<Complex32>,
}

impl TransferFunction {
    /// Shape of the (unpadded) volumes this transfer function applies to.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn otf(&self) -> &Array3<Complex32> {
        &self.otf
    }
}

/// Outcome of one slice restoration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveReport {
    pub iterations_run: usize,
    pub converged_early: bool,
    pub background: BackgroundStats,
}

/// Richardson-Lucy engine for single 3D volumes.
pub struct RlSolver {
    config: SolverConfig,
    backend: Arc<dyn ComputeBackend>,
}

impl RlSolver {
    pub fn new(config: SolverConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        config.validate()?;
        if !config.use_otf && config.convergence_ratio.is_some() {
            log::warn!("convergence_ratio is ignored by the direct-space solver");
        }
        log::debug!(
            "RL solver ({}) on backend {}",
            if config.use_otf { "otf" } else { "direct" },
            backend.name()
        );
        Ok(RlSolver { config, backend })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Builds the transfer function of `kernel` for volumes of `shape`.
    ///
    /// The direct variant normalizes the kernel to unit energy and works on the padded shape.
    /// The OTF variant uses the raw kernel, applies the low-pass cutoff and replaces exact
    /// zeros with the regularization constant when those options are enabled.
    ///
    /// # Errors
    /// `SingularOtf` when the OTF variant ends up with zero entries and regularization is
    /// disabled, `InvalidPsfParameters` for a kernel without positive energy in the direct
    /// variant, `ShapeMismatch` for an empty shape.
    pub fn prepare(
        &self,
        kernel: &Kernel,
        shape: (usize, usize, usize),
    ) -> Result<TransferFunction> {
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(DeconError::ShapeMismatch(format!(
                "cannot deconvolve an empty volume of shape {shape:?}"
            )));
        }

        if !self.config.use_otf {
            let total = kernel.sum();
            if !(total > 0.0) || !total.is_finite() {
                return Err(DeconError::InvalidPsfParameters(format!(
                    "kernel energy must be positive, got {total}"
                )));
            }
            let pad = 2 * self.config.pad_amount;
            let padded = (shape.0 + pad, shape.1 + pad, shape.2 + pad);
            let mut otf = kernel_to_otf(kernel, padded, self.backend.as_ref());
            otf.mapv_inplace(|c| c / total);
            return Ok(TransferFunction { shape, otf });
        }

        let mut otf = kernel_to_otf(kernel, shape, self.backend.as_ref());
        if self.config.use_cutoff {
            let removed = apply_low_pass(&mut otf, self.config.cutoff_frequency);
            log::debug!(
                "low-pass cutoff {} removed {removed} of {} OTF entries",
                self.config.cutoff_frequency,
                otf.len()
            );
        }
        let zero_entries = otf.iter().filter(|c| c.is_zero()).count();
        if zero_entries > 0 {
            if !self.config.use_regularization {
                return Err(DeconError::SingularOtf { zero_entries });
            }
            let constant = Complex32::new(self.config.regularization_constant, 0.0);
            otf.mapv_inplace(|c| if c.is_zero() { constant } else { c });
        }
        Ok(TransferFunction { shape, otf })
    }

    /// Restores one volume: prepares the transfer function, completes the background and runs
    /// the configured variant.
    pub fn deconvolve<R: Rng + ?Sized>(
        &self,
        volume: ArrayView3<f32>,
        kernel: &Kernel,
        rng: &mut R,
    ) -> Result<Array3<f32>> {
        let transfer = self.prepare(kernel, volume.dim())?;
        let (restored, _) = self.deconvolve_prepared(volume, &transfer, rng)?;
        Ok(restored)
    }

    /// Restores one volume with a transfer function prepared by [`RlSolver::prepare`].
    ///
    /// The input is never modified; background completion works on a private copy.
    pub fn deconvolve_prepared<R: Rng + ?Sized>(
        &self,
        volume: ArrayView3<f32>,
        transfer: &TransferFunction,
        rng: &mut R,
    ) -> Result<(Array3<f32>, SolveReport)> {
        if volume.dim() != transfer.shape {
            return Err(DeconError::ShapeMismatch(format!(
                "transfer function prepared for {:?}, volume has shape {:?}",
                transfer.shape,
                volume.dim()
            )));
        }
        let (observed, background) = complete_background(volume, rng)?;

        let (restored, iterations_run, converged_early) = if self.config.use_otf {
            self.richardson_lucy_otf(observed, &transfer.otf)
        } else {
            let restored = self.richardson_lucy_direct(observed, &transfer.otf);
            (restored, self.config.iterations, false)
        };

        Ok((
            restored,
            SolveReport {
                iterations_run,
                converged_early,
                background,
            },
        ))
    }

    fn convolve(&self, data: ArrayView3<f32>, otf: &Array3<Complex32>, adjoint: bool) -> Array3<f32> {
        let mut spectrum = self.backend.rfft3(data);
        Zip::from(&mut spectrum).and(otf).for_each(|s, &h| {
            *s *= if adjoint { h.conj() } else { h };
        });
        self.backend.irfft3(&spectrum)
    }

    fn richardson_lucy_direct(&self, observed: Array3<f32>, otf: &Array3<Complex32>) -> Array3<f32> {
        let pad = self.config.pad_amount;
        let epsilon = self.config.epsilon;
        let observed = pad_reflect3(observed.view(), pad);
        let mut estimate = observed.clone();

        for iteration in 0..self.config.iterations {
            let blurred = self.convolve(estimate.view(), otf, false);
            let ratio = Zip::from(&observed)
                .and(&blurred)
                .map_collect(|&o, &b| o / if b == 0.0 { epsilon } else { b });
            let correction = self.convolve(ratio.view(), otf, true);
            estimate *= &correction;
            log::trace!("direct RL iteration {} done", iteration + 1);
        }

        crop3(estimate, pad)
    }

    fn richardson_lucy_otf(
        &self,
        observed: Array3<f32>,
        otf: &Array3<Complex32>,
    ) -> (Array3<f32>, usize, bool) {
        let config = &self.config;
        let regularization = if config.use_regularization {
            config.regularization_constant
        } else {
            0.0
        };
        let fallback = Complex32::new(config.epsilon, 0.0);

        let observed_ft = self.backend.rfft3(observed.view());
        let mut estimate_ft = observed_ft.clone();
        let mut current = observed;
        let mut initial_change: Option<f64> = None;

        for iteration in 1..=config.iterations {
            let quotient = Zip::from(&observed_ft)
                .and(&estimate_ft)
                .map_collect(|&o, &e| {
                    let denominator = e + regularization;
                    o / if denominator.is_zero() { fallback } else { denominator }
                });
            let mut correction = self.backend.irfft3(&quotient);
            if config.use_regularization {
                // TODO: revisit the one-sided floor; a symmetric clamp around 1 may be the intent.
                correction.mapv_inplace(|v| v.max(config.regularization_constant));
            }

            let correction_ft = self.backend.rfft3(correction.view());
            Zip::from(&mut estimate_ft)
                .and(&correction_ft)
                .and(otf)
                .for_each(|e, &c, &h| *e = *e * c / h);
            let next = self.backend.irfft3(&estimate_ft);

            if let Some(ratio) = config.convergence_ratio {
                let change = mean_squared_difference(next.view(), current.view());
                match initial_change {
                    None => initial_change = Some(change),
                    Some(initial) if change < initial * ratio as f64 => {
                        log::debug!(
                            "OTF RL converged after {iteration} of {} iterations (change {change:e}, initial {initial:e})",
                            config.iterations
                        );
                        return (next, iteration, true);
                    }
                    Some(_) => {}
                }
            }
            current = next;
        }

        (current, config.iterations, false)
    }
}

/// Places `kernel` with its center voxel at the array origin of a zero volume of `shape` and
/// returns its Fourier transform.
///
/// Kernel voxels that fall outside `shape` wrap around, so kernels larger than the volume stay
/// energy-preserving under circular convolution.
pub fn kernel_to_otf(
    kernel: &Kernel,
    shape: (usize, usize, usize),
    backend: &dyn ComputeBackend,
) -> Array3<Complex32> {
    let [cz, cy, cx] = kernel.center();
    let mut placed = Array3::<f32>::zeros(shape);
    for ((z, y, x), &v) in kernel.view().indexed_iter() {
        let idx = [
            (z as isize - cz as isize).rem_euclid(shape.0 as isize) as usize,
            (y as isize - cy as isize).rem_euclid(shape.1 as isize) as usize,
            (x as isize - cx as isize).rem_euclid(shape.2 as isize) as usize,
        ];
        placed[idx] += v;
    }
    backend.rfft3(placed.view())
}

/// Zeroes every OTF entry outside a sphere around the zero frequency.
///
/// Distances are measured in centered frequency-index space (zero frequency in the middle of
/// the volume) and normalized by the largest possible distance, `|(nz/2, ny/2, nx/2)|`.
/// Entries whose normalized distance exceeds `cutoff` are zeroed. Returns the number of
/// zeroed entries.
pub fn apply_low_pass(otf: &mut Array3<Complex32>, cutoff: f32) -> usize {
    let (nz, ny, nx) = otf.dim();
    let half = [nz / 2, ny / 2, nx / 2];
    let max_distance = half.iter().map(|&h| (h * h) as f64).sum::<f64>().sqrt();
    if max_distance == 0.0 {
        return 0;
    }
    // offset of frequency index k from the centre after shifting zero frequency to n/2
    let centered = |k: usize, n: usize, h: usize| ((k + h) % n) as f64 - h as f64;

    let mut removed = 0;
    for ((z, y, x), value) in otf.indexed_iter_mut() {
        let dz = centered(z, nz, half[0]);
        let dy = centered(y, ny, half[1]);
        let dx = centered(x, nx, half[2]);
        let distance = (dz * dz + dy * dy + dx * dx).sqrt() / max_distance;
        if distance > cutoff as f64 {
            *value = Complex32::zero();
            removed += 1;
        }
    }
    removed
}
