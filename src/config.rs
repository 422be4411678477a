use crate::error::{DeconError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Multiplier between the acquisition spacing found in the file metadata and the z-spacing
/// handed to the kernel synthesizer when none is configured explicitly.
pub const DEFAULT_Z_SPACING_SCALE: f64 = 10.0;

/// Parameters of a single Richardson-Lucy run.
///
/// Constructed once per run and read-only for its duration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub iterations: usize,
    /// Voxels of reflected border added on every side before direct-space iteration.
    pub pad_amount: usize,
    /// Selects the frequency-domain variant.
    pub use_otf: bool,
    pub use_regularization: bool,
    pub regularization_constant: f32,
    pub use_cutoff: bool,
    /// Fraction of the maximum frequency radius kept by the spherical low-pass mask.
    pub cutoff_frequency: f32,
    /// Early-stop threshold relative to the first iteration's change. `None` disables tracking.
    pub convergence_ratio: Option<f32>,
    /// Substituted for denominators that are exactly zero.
    pub epsilon: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            iterations: 10,
            pad_amount: 16,
            use_otf: false,
            use_regularization: false,
            regularization_constant: 1e-2,
            use_cutoff: false,
            cutoff_frequency: 0.5,
            convergence_ratio: None,
            epsilon: 1e-6,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(DeconError::InvalidConfig(
                "iterations must be a positive integer".to_string(),
            ));
        }
        if !(self.regularization_constant > 0.0) || !self.regularization_constant.is_finite() {
            return Err(DeconError::InvalidConfig(format!(
                "regularization_constant must be a small positive number, got {}",
                self.regularization_constant
            )));
        }
        if !(self.cutoff_frequency > 0.0 && self.cutoff_frequency <= 1.0) {
            return Err(DeconError::InvalidConfig(format!(
                "cutoff_frequency must lie in (0, 1], got {}",
                self.cutoff_frequency
            )));
        }
        if let Some(ratio) = self.convergence_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(DeconError::InvalidConfig(format!(
                    "convergence_ratio must lie in (0, 1], got {ratio}"
                )));
            }
        }
        if !(self.epsilon > 0.0) || !self.epsilon.is_finite() {
            return Err(DeconError::InvalidConfig(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Full configuration surface of a deconvolution run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconConfig {
    #[serde(flatten)]
    pub solver: SolverConfig,
    pub channel_count: usize,
    /// Micron per voxel along z used to rescale the PSF. Derived from the metadata when absent.
    pub z_spacing: Option<f64>,
    /// Seed for the background noise. A fresh seed is drawn per run when absent.
    pub seed: Option<u64>,
    /// Deconvolve timepoints concurrently.
    pub parallel: bool,
    /// Run every multiple of 5 iterations up to `iterations` and keep each result.
    pub iteration_sweep: bool,
}

impl Default for DeconConfig {
    fn default() -> Self {
        DeconConfig {
            solver: SolverConfig::default(),
            channel_count: 1,
            z_spacing: None,
            seed: None,
            parallel: true,
            iteration_sweep: false,
        }
    }
}

impl DeconConfig {
    /// Reads a JSON configuration file. Missing keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: DeconConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        log::debug!("loaded configuration from {path:?}: {config:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.solver.validate()?;
        if !(1..=2).contains(&self.channel_count) {
            return Err(DeconError::InvalidConfig(format!(
                "channel_count must be 1 or 2, got {}",
                self.channel_count
            )));
        }
        if let Some(z_spacing) = self.z_spacing {
            if !(z_spacing > 0.0) || !z_spacing.is_finite() {
                return Err(DeconError::InvalidConfig(format!(
                    "z_spacing must be positive, got {z_spacing}"
                )));
            }
        }
        Ok(())
    }

    /// The configured z-spacing, or the metadata spacing scaled by [`DEFAULT_Z_SPACING_SCALE`].
    pub fn resolve_z_spacing(&self, metadata_spacing: f64) -> f64 {
        self.z_spacing
            .unwrap_or(metadata_spacing * DEFAULT_Z_SPACING_SCALE)
    }
}
