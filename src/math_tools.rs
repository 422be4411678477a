//! This module provides the array helpers used by the kernel synthesizer, the background
//! completer and the solver: a separable Gaussian filter with reflected borders, reflect
//! padding and cropping of 3D volumes, and a handful of summary statistics.

use ndarray::{s, Array3, ArrayView3, Axis, Zip};

/// Number of standard deviations after which the Gaussian window is truncated.
pub const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Sigmas below this are treated as "no smoothing along this axis".
const MIN_SIGMA: f64 = 1e-15;

/// Maps an out-of-range index back into `0..n` by mirroring about the array edges.
///
/// The edge sample is repeated (`d c b a | a b c d | d c b a`), which matches the `reflect`
/// border mode of common image processing libraries. Works for arbitrarily large overshoot.
pub fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// Normalized 1D Gaussian window of radius `round(GAUSSIAN_TRUNCATE * sigma)`.
pub fn gaussian_window(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Applies an anisotropic Gaussian filter to a 3D array.
///
/// The filter is separable, so each axis is smoothed independently with its own sigma
/// (given in voxels). Borders are handled with [`reflect_index`].
///
/// # Arguments
/// - `input`: The array to smooth.
/// - `sigma`: Standard deviation per axis, in `(z, y, x)` order.
///
/// # Returns
/// A new array with the same shape as `input`.
pub fn gaussian_filter3(input: ArrayView3<f32>, sigma: [f64; 3]) -> Array3<f32> {
    let mut current = input.to_owned();
    for (axis, &sd) in sigma.iter().enumerate() {
        if sd <= MIN_SIGMA {
            continue;
        }
        let window = gaussian_window(sd);
        let radius = (window.len() / 2) as isize;
        let mut smoothed = Array3::<f32>::zeros(current.raw_dim());
        Zip::from(smoothed.lanes_mut(Axis(axis)))
            .and(current.lanes(Axis(axis)))
            .par_for_each(|mut out, lane| {
                let n = lane.len();
                for j in 0..n {
                    let mut acc = 0.0f64;
                    for (k, w) in window.iter().enumerate() {
                        let idx = reflect_index(j as isize + k as isize - radius, n);
                        acc += w * lane[idx] as f64;
                    }
                    out[j] = acc as f32;
                }
            });
        current = smoothed;
    }
    current
}

/// Pads every side of a 3D array by `pad` voxels, filling the border by reflection.
pub fn pad_reflect3(input: ArrayView3<f32>, pad: usize) -> Array3<f32> {
    if pad == 0 {
        return input.to_owned();
    }
    let (nz, ny, nx) = input.dim();
    let p = pad as isize;
    Array3::from_shape_fn((nz + 2 * pad, ny + 2 * pad, nx + 2 * pad), |(z, y, x)| {
        input[[
            reflect_index(z as isize - p, nz),
            reflect_index(y as isize - p, ny),
            reflect_index(x as isize - p, nx),
        ]]
    })
}

/// Removes a border of `pad` voxels from every side, undoing [`pad_reflect3`].
pub fn crop3(input: Array3<f32>, pad: usize) -> Array3<f32> {
    if pad == 0 {
        return input;
    }
    let (nz, ny, nx) = input.dim();
    input
        .slice(s![pad..nz - pad, pad..ny - pad, pad..nx - pad])
        .to_owned()
}

/// Most frequent value; ties resolve to the smallest value. `None` for an empty slice.
///
/// The slice is sorted in place.
pub fn mode(values: &mut [f32]) -> Option<f32> {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mut best: Option<(f32, usize)> = None;
    for run in values.chunk_by(|a, b| a == b) {
        match best {
            Some((_, count)) if count >= run.len() => {}
            _ => best = Some((run[0], run.len())),
        }
    }
    best.map(|(value, _)| value)
}

/// Sample standard deviation (one delta degree of freedom). Zero for fewer than two values.
pub fn sample_std(values: &[f32]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let ss: f64 = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum();
    (ss / (n - 1) as f64).sqrt()
}

/// Mean of the squared element-wise differences of two equally shaped arrays.
pub fn mean_squared_difference(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f64 {
    let sum = Zip::from(a)
        .and(b)
        .fold(0.0f64, |acc, &x, &y| acc + ((x - y) as f64).powi(2));
    sum / a.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reflect_index_mirrors_with_edge_repeat() {
        let mapped: Vec<usize> = (-4..8).map(|i| reflect_index(i, 4)).collect();
        assert_eq!(mapped, vec![3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
    }

    #[test]
    fn gaussian_window_is_normalized_and_symmetric() {
        let w = gaussian_window(1.5);
        assert_eq!(w.len(), 13);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for i in 0..w.len() / 2 {
            assert_abs_diff_eq!(w[i], w[w.len() - 1 - i], epsilon = 1e-15);
        }
    }

    #[test]
    fn gaussian_filter_preserves_constant_and_skips_zero_sigma() {
        let constant = Array3::<f32>::from_elem((5, 6, 7), 3.0);
        let filtered = gaussian_filter3(constant.view(), [1.0, 2.0, 0.5]);
        for v in filtered.iter() {
            assert_abs_diff_eq!(*v, 3.0, epsilon = 1e-5);
        }

        let mut impulse = Array3::<f32>::zeros((5, 5, 5));
        impulse[[2, 2, 2]] = 1.0;
        let filtered = gaussian_filter3(impulse.view(), [0.0, 0.0, 1.0]);
        // no spreading along z and y
        assert_eq!(filtered[[1, 2, 2]], 0.0);
        assert_eq!(filtered[[2, 1, 2]], 0.0);
        assert!(filtered[[2, 2, 1]] > 0.0);
    }

    #[test]
    fn pad_then_crop_is_identity() {
        let a = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        let padded = pad_reflect3(a.view(), 2);
        assert_eq!(padded.dim(), (7, 8, 9));
        assert_eq!(padded[[0, 2, 2]], a[[1, 0, 0]]);
        assert_eq!(crop3(padded, 2), a);
    }

    #[test]
    fn mode_prefers_smallest_on_ties() {
        let mut values = vec![5.0, 3.0, 5.0, 3.0, 9.0];
        assert_eq!(mode(&mut values), Some(3.0));
        let mut values = vec![7.0, 2.0, 7.0];
        assert_eq!(mode(&mut values), Some(7.0));
        assert_eq!(mode(&mut []), None);
    }

    #[test]
    fn sample_std_uses_one_degree_of_freedom() {
        assert_abs_diff_eq!(sample_std(&[1.0, 2.0, 3.0, 4.0]), 1.2909944, epsilon = 1e-6);
        assert_eq!(sample_std(&[4.0]), 0.0);
    }
}
