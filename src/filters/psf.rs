use crate::error::{DeconError, Result};
use crate::math_tools::gaussian_filter3;
use ndarray::{Array2, Array3, ArrayView3};

/// Extent of kernels synthesized from a covariance matrix, in `(z, y, x)` order.
pub const KERNEL_EXTENT: [usize; 3] = [25, 25, 25];

/// Describes the point spread function of one channel.
///
/// A PSF is either summarized by the 3×3 covariance-like matrix estimated from calibration
/// beads, or already available as a sampled 3D kernel.
///
/// # Variants
/// - `Covariance`: Symmetric 3×3 matrix. `[0,0]` and `[1,1]` hold the y and x variance in
///   voxels², `[2,2]` holds the z variance in bead-stack units.
/// - `Kernel`: A precomputed, already normalized 3D kernel in `(z, y, x)` order.
#[derive(Clone, Debug, PartialEq)]
pub enum PsfDescriptor {
    Covariance(Array2<f64>),
    Kernel(Array3<f32>),
}

/// Immutable 3D convolution kernel, created once per channel and shared read-only across all
/// timepoints of that channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    data: Array3<f32>,
}

impl Kernel {
    /// Wraps a kernel array. Every axis must be non-empty.
    pub fn new(data: Array3<f32>) -> Result<Self> {
        if data.is_empty() {
            return Err(DeconError::ShapeMismatch(format!(
                "kernel must not have empty axes, got shape {:?}",
                data.shape()
            )));
        }
        Ok(Kernel { data })
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Total energy of the kernel.
    pub fn sum(&self) -> f32 {
        self.data.sum()
    }

    /// Index of the voxel treated as the kernel origin: `extent / 2` along every axis.
    pub fn center(&self) -> [usize; 3] {
        let (nz, ny, nx) = self.data.dim();
        [nz / 2, ny / 2, nx / 2]
    }
}

/// Turns a PSF descriptor into a convolution kernel.
///
/// A precomputed kernel is passed through untouched. A covariance matrix becomes an
/// anisotropic Gaussian: a unit impulse in the middle of a [`KERNEL_EXTENT`] volume smoothed
/// with per-axis standard deviations
///
/// - z: `sqrt(m[2,2]) / z_spacing`
/// - y: `sqrt(m[0,0])`
/// - x: `sqrt(m[1,1])`
///
/// and normalized to unit energy. Off-diagonal terms are ignored. The z-axis is rescaled
/// because the bead stack and the acquisition may be sampled differently along z.
///
/// # Errors
/// `InvalidPsfParameters` for a non-positive or non-finite `z_spacing`, a matrix that is not
/// 3×3, or negative/non-finite diagonal entries. `ShapeMismatch` for an empty kernel.
pub fn synthesize_kernel(descriptor: &PsfDescriptor, z_spacing: f64) -> Result<Kernel> {
    match descriptor {
        PsfDescriptor::Kernel(kernel) => Kernel::new(kernel.clone()),
        PsfDescriptor::Covariance(matrix) => {
            if !(z_spacing > 0.0) || !z_spacing.is_finite() {
                return Err(DeconError::InvalidPsfParameters(format!(
                    "z_spacing must be positive, got {z_spacing}"
                )));
            }
            if matrix.dim() != (3, 3) {
                return Err(DeconError::InvalidPsfParameters(format!(
                    "covariance must be 3x3, got {:?}",
                    matrix.shape()
                )));
            }
            let diagonal = [matrix[[0, 0]], matrix[[1, 1]], matrix[[2, 2]]];
            if diagonal.iter().any(|v| !(*v >= 0.0) || !v.is_finite()) {
                return Err(DeconError::InvalidPsfParameters(format!(
                    "covariance diagonal must be non-negative, got {diagonal:?}"
                )));
            }

            let sigma = [
                matrix[[2, 2]].sqrt() / z_spacing,
                matrix[[0, 0]].sqrt(),
                matrix[[1, 1]].sqrt(),
            ];
            log::debug!("synthesizing {KERNEL_EXTENT:?} kernel with sigma (z, y, x) = {sigma:?}");

            let mut impulse = Array3::<f32>::zeros(KERNEL_EXTENT);
            // offsets 0 and 1 coincide for odd extents and straddle the middle for even ones
            for offset in [0, 1] {
                let idx = KERNEL_EXTENT.map(|n| (n - offset) / 2);
                impulse[idx] = 1.0;
            }
            let mut kernel = gaussian_filter3(impulse.view(), sigma);
            let total = kernel.sum();
            if !(total > 0.0) {
                return Err(DeconError::InvalidPsfParameters(
                    "synthesized kernel has no energy".to_string(),
                ));
            }
            kernel.mapv_inplace(|v| v / total);
            Kernel::new(kernel)
        }
    }
}
