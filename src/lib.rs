//! Richardson-Lucy deconvolution of fluorescence microscopy acquisitions.
//!
//! Volumes are `(time, z, channel, y, x)` stacks of `f32` samples. Each channel carries its own
//! point spread function, either as the covariance matrix measured on calibration beads or as
//! a precomputed kernel. The [`batch::VolumeBatchRunner`] synthesizes one kernel per channel,
//! completes the clipped background of every slice and restores it with the
//! [`filters::deconvolution::RlSolver`].

pub mod backend;
pub mod batch;
pub mod config;
pub mod data_container;
pub mod error;
pub mod filters;
pub mod io;
pub mod math_tools;

pub use backend::{ComputeBackend, CpuBackend};
pub use batch::VolumeBatchRunner;
pub use config::{DeconConfig, SolverConfig};
pub use error::{DeconError, Result};
pub use filters::psf::PsfDescriptor;
