//! Restoration filters for 3D fluorescence microscopy volumes.
//!
//! The filters are applied to one `(z, y, x)` slice at a time, in the order in which they are
//! listed here: a kernel is derived from the PSF of the channel, the clipped background of the
//! slice is completed, and the Richardson-Lucy solver restores the slice.

/// Point Spread Function handling.
/// Turns calibration covariances or precomputed arrays into normalized convolution kernels.
pub mod psf;

/// Replaces clipped zero voxels with noise drawn from the background distribution.
pub mod background;

/// Richardson-Lucy deconvolution in direct space and in the frequency domain.
/// Removes the blur introduced by the optical system using the kernel of the channel.
pub mod deconvolution;
