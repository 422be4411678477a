//! Error taxonomy shared by the deconvolution core and its I/O boundary.
//!
//! Core failures are terminal for the batch item they occur in. Nothing in the crate retries:
//! feeding the same inputs to the solver again reproduces the same failure.

use cancellable_loops::LoopError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = DeconError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeconError {
    /// Bad z-spacing or covariance entries handed to the kernel synthesizer.
    #[error("invalid PSF parameters: {0}")]
    InvalidPsfParameters(String),

    /// A slice without any strictly positive voxel, so no background can be estimated.
    #[error("cannot estimate background: volume has no positive voxels")]
    EmptyForeground,

    /// Zero OTF entries while regularization is disabled.
    #[error("optical transfer function has {zero_entries} zero entries and regularization is disabled")]
    SingularOtf { zero_entries: usize },

    /// Kernel/volume rank or channel-count inconsistency.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("deconvolution was cancelled")]
    Cancelled,

    #[error("unsupported file content: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<LoopError<DeconError>> for DeconError {
    fn from(err: LoopError<DeconError>) -> Self {
        match err {
            LoopError::Cancelled => DeconError::Cancelled,
            LoopError::Failed(err) => err,
        }
    }
}
