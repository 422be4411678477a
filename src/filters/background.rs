//! Background completion of clipped or unsampled voxels.
//!
//! Zero voxels in an acquisition are almost never true dark signal. Leaving them at zero gives
//! the Richardson-Lucy iteration hard edges to ring against, so they are replaced with noise
//! drawn from the background distribution of the positive voxels.

use crate::error::{DeconError, Result};
use crate::math_tools::{mode, sample_std};
use ndarray::{Array3, ArrayView3};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Background distribution estimated from the strictly positive voxels of a volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackgroundStats {
    /// Most frequent positive value.
    pub mode: f32,
    /// Sample standard deviation of the positive values.
    pub std: f32,
    /// Number of voxels that were exactly zero.
    pub zero_voxels: usize,
}

impl BackgroundStats {
    pub fn estimate(volume: ArrayView3<f32>) -> Result<Self> {
        let mut positive: Vec<f32> = volume.iter().copied().filter(|v| *v > 0.0).collect();
        let zero_voxels = volume.iter().filter(|v| **v == 0.0).count();
        let std = sample_std(&positive) as f32;
        let mode = mode(&mut positive).ok_or(DeconError::EmptyForeground)?;
        Ok(BackgroundStats {
            mode,
            std,
            zero_voxels,
        })
    }
}

/// Returns a copy of `volume` whose exactly-zero voxels are replaced by
/// `mode + std * N(0, 1)`, drawn independently per voxel from `rng`.
///
/// The caller's buffer is never modified. Re-running draws fresh noise, so the result is only
/// reproducible for a reproducible `rng`.
///
/// # Errors
/// `EmptyForeground` when the volume has no strictly positive voxel.
pub fn complete_background<R: Rng + ?Sized>(
    volume: ArrayView3<f32>,
    rng: &mut R,
) -> Result<(Array3<f32>, BackgroundStats)> {
    let stats = BackgroundStats::estimate(volume)?;
    let mut completed = volume.to_owned();
    if stats.zero_voxels > 0 {
        log::debug!(
            "filling {} zero voxels with background {} ± {}",
            stats.zero_voxels,
            stats.mode,
            stats.std
        );
        for v in completed.iter_mut().filter(|v| **v == 0.0) {
            let noise: f32 = StandardNormal.sample(rng);
            *v = stats.mode + stats.std * noise;
        }
    }
    Ok((completed, stats))
}
