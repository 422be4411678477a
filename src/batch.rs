//! Batch deconvolution of multi-dimensional acquisitions.
//!
//! A batch is a `(time, z, channel, y, x)` volume. Every `(timepoint, channel)` pair is an
//! independent 3D slice restored with the kernel of its channel. Kernels and their transfer
//! functions are built once per channel and shared read-only by all timepoints.

use crate::backend::ComputeBackend;
use crate::config::DeconConfig;
use crate::data_container::{BatchContext, ImageMetadata};
use crate::error::{DeconError, Result};
use crate::filters::deconvolution::RlSolver;
use crate::filters::psf::{synthesize_kernel, PsfDescriptor};
use cancellable_loops::{par_try_for_each_cancellable, try_for_each_cancellable};
use ndarray::parallel::prelude::*;
use ndarray::{Array5, ArrayD, ArrayView4, ArrayViewD, ArrayViewMut4, Axis, IxDyn, Order};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Maps the shape of an input volume onto the canonical `(T, Z, C, Y, X)` layout.
///
/// | rank | channels = 1   | channels = 2   |
/// |------|----------------|----------------|
/// | 2    | `(Y, X)`       | -              |
/// | 3    | `(Z, Y, X)`    | -              |
/// | 4    | `(T, Z, Y, X)` | `(Z, C, Y, X)` |
/// | 5    | `(T, Z, C, Y, X)` | `(T, Z, C, Y, X)` |
///
/// # Errors
/// `ShapeMismatch` when the rank is unsupported or the channel axis does not hold
/// `channel_count` entries.
pub fn normalize_rank(shape: &[usize], channel_count: usize) -> Result<[usize; 5]> {
    let normalized = match (shape, channel_count) {
        (&[y, x], 1) => Some([1, 1, 1, y, x]),
        (&[z, y, x], 1) => Some([1, z, 1, y, x]),
        (&[t, z, y, x], 1) => Some([t, z, 1, y, x]),
        (&[z, c, y, x], _) if c == channel_count => Some([1, z, c, y, x]),
        (&[t, z, c, y, x], _) if c == channel_count => Some([t, z, c, y, x]),
        _ => None,
    };
    normalized.ok_or_else(|| {
        DeconError::ShapeMismatch(format!(
            "cannot interpret a volume of shape {shape:?} as {channel_count}-channel acquisition"
        ))
    })
}

/// Reshapes a canonical `(T, Z, C, Y, X)` result back to the shape of the input.
pub fn restore_rank(volume: Array5<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    volume
        .into_shape_with_order(IxDyn(shape))
        .map_err(|err| DeconError::ShapeMismatch(format!("cannot restore shape {shape:?}: {err}")))
}

/// Iteration counts to run: `[iterations]`, or every multiple of 5 up to `iterations` plus
/// `iterations` itself when sweeping.
pub fn iteration_schedule(iterations: usize, sweep: bool) -> Vec<usize> {
    let mut schedule: Vec<usize> = if sweep {
        (5..=iterations).step_by(5).collect()
    } else {
        Vec::new()
    };
    if schedule.last() != Some(&iterations) {
        schedule.push(iterations);
    }
    schedule
}

/// Runs the Richardson-Lucy solver over every `(timepoint, channel)` slice of a batch.
pub struct VolumeBatchRunner {
    solver: RlSolver,
    seed: Option<u64>,
    parallel: bool,
    abort_flag: Arc<AtomicBool>,
    progress_lock: Option<Arc<RwLock<Option<f32>>>>,
}

impl VolumeBatchRunner {
    pub fn new(config: &DeconConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        config.validate()?;
        Ok(VolumeBatchRunner {
            solver: RlSolver::new(config.solver.clone(), backend)?,
            seed: config.seed,
            parallel: config.parallel,
            abort_flag: Arc::new(AtomicBool::new(false)),
            progress_lock: None,
        })
    }

    /// Shares an abort flag with the caller. Raising it stops the batch before the next slice.
    pub fn with_abort_flag(mut self, abort_flag: Arc<AtomicBool>) -> Self {
        self.abort_flag = abort_flag;
        self
    }

    /// Publishes the fraction of finished slices while a batch runs, `None` otherwise.
    pub fn with_progress_lock(mut self, progress_lock: Arc<RwLock<Option<f32>>>) -> Self {
        self.progress_lock = Some(progress_lock);
        self
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_flag)
    }

    pub fn solver(&self) -> &RlSolver {
        &self.solver
    }

    fn set_progress(&self, value: Option<f32>) {
        if let Some(lock) = &self.progress_lock {
            if let Ok(mut progress) = lock.write() {
                *progress = value;
            }
        }
    }

    /// Deconvolves every slice of `input` and returns a volume of the same shape.
    ///
    /// `psfs` holds one descriptor per channel. On success the channel count of `metadata` is
    /// refreshed; on failure nothing is returned and `metadata` is left untouched.
    ///
    /// # Errors
    /// `ShapeMismatch` when the channel count of `metadata` differs from the batch context.
    /// The first slice failure aborts the whole batch and is returned as is. A raised abort
    /// flag yields `Cancelled`.
    pub fn run(
        &self,
        input: ArrayViewD<f32>,
        psfs: &[PsfDescriptor],
        context: &BatchContext,
        metadata: &mut ImageMetadata,
    ) -> Result<ArrayD<f32>> {
        let start = Instant::now();
        if !(1..=2).contains(&context.channel_count) {
            return Err(DeconError::InvalidConfig(format!(
                "channel_count must be 1 or 2, got {}",
                context.channel_count
            )));
        }
        if psfs.len() != context.channel_count {
            return Err(DeconError::ShapeMismatch(format!(
                "{} PSF descriptors for {} channels",
                psfs.len(),
                context.channel_count
            )));
        }

        if metadata.channels != context.channel_count {
            return Err(DeconError::ShapeMismatch(format!(
                "acquisition has {} channel(s), batch configured for {}",
                metadata.channels, context.channel_count
            )));
        }

        let original_shape = input.shape().to_vec();
        let shape = normalize_rank(&original_shape, context.channel_count)?;
        let [frames, depth, channels, height, width] = shape;
        let input = input
            .to_shape((shape, Order::RowMajor))
            .map_err(|err| DeconError::ShapeMismatch(err.to_string()))?;

        let transfers = psfs
            .iter()
            .map(|psf| {
                let kernel = synthesize_kernel(psf, context.z_spacing)?;
                self.solver.prepare(&kernel, (depth, height, width))
            })
            .collect::<Result<Vec<_>>>()?;

        let seed = self.seed.unwrap_or_else(rand::random);
        log::info!(
            "deconvolving {frames} timepoint(s) x {channels} channel(s) of {depth}x{height}x{width} voxels, {} iterations (seed {seed})",
            self.solver.config().iterations
        );

        let total = frames * channels;
        let finished = AtomicUsize::new(0);
        self.set_progress(Some(0.0));

        let process_timepoint =
            |t: usize, mut out: ArrayViewMut4<f32>, frame: ArrayView4<f32>| -> Result<()> {
                try_for_each_cancellable(0..channels, &self.abort_flag, |c| -> Result<()> {
                    let slice_index = (t * channels + c) as u64;
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(slice_index));
                    let (restored, report) = self.solver.deconvolve_prepared(
                        frame.index_axis(Axis(1), c),
                        &transfers[c],
                        &mut rng,
                    )?;
                    log::debug!(
                        "timepoint {t} channel {c}: {} iteration(s){}, {} zero voxel(s) completed",
                        report.iterations_run,
                        if report.converged_early { " (converged)" } else { "" },
                        report.background.zero_voxels
                    );
                    out.index_axis_mut(Axis(1), c).assign(&restored);

                    let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                    self.set_progress(Some(done as f32 / total as f32));
                    Ok(())
                })
                .map_err(DeconError::from)
            };

        let mut output = Array5::<f32>::zeros(shape);
        let result = if self.parallel {
            par_try_for_each_cancellable(
                output
                    .axis_iter_mut(Axis(0))
                    .into_par_iter()
                    .zip(input.axis_iter(Axis(0)).into_par_iter())
                    .enumerate(),
                &self.abort_flag,
                |(t, (out, frame))| process_timepoint(t, out, frame),
            )
        } else {
            try_for_each_cancellable(
                output
                    .axis_iter_mut(Axis(0))
                    .zip(input.axis_iter(Axis(0)))
                    .enumerate(),
                &self.abort_flag,
                |(t, (out, frame))| process_timepoint(t, out, frame),
            )
        };
        self.set_progress(None);
        result?;

        metadata.set_channels(context.channel_count);
        log::info!("batch finished in {:?}", start.elapsed());
        restore_rank(output, &original_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::config::SolverConfig;
    use crate::math_tools::gaussian_filter3;
    use ndarray::{arr2, s, Array3, Array4, Axis};
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn covariance(diagonal: [f64; 3]) -> PsfDescriptor {
        let [yy, xx, zz] = diagonal;
        PsfDescriptor::Covariance(arr2(&[[yy, 0.0, 0.0], [0.0, xx, 0.0], [0.0, 0.0, zz]]))
    }

    fn runner(iterations: usize, parallel: bool, seed: Option<u64>) -> VolumeBatchRunner {
        let config = DeconConfig {
            solver: SolverConfig {
                iterations,
                pad_amount: 4,
                ..SolverConfig::default()
            },
            parallel,
            seed,
            ..DeconConfig::default()
        };
        VolumeBatchRunner::new(&config, Arc::new(CpuBackend::new())).unwrap()
    }

    fn context(channel_count: usize) -> BatchContext {
        BatchContext {
            channel_count,
            z_spacing: 1.0,
        }
    }

    /// Blurred bright cube on a background of 100 with additive noise of std 5.
    fn cube_frame(n: usize, rng: &mut StdRng) -> Array3<f32> {
        let mut truth = Array3::<f32>::from_elem((n, n, n), 100.0);
        let (lo, hi) = (3 * n / 8, 5 * n / 8);
        truth.slice_mut(s![lo..hi, lo..hi, lo..hi]).fill(1000.0);
        let mut blurred = gaussian_filter3(truth.view(), [1.0, 1.0, 1.0]);
        blurred.mapv_inplace(|v| {
            let noise: f32 = rng.sample(StandardNormal);
            v + 5.0 * noise
        });
        blurred
    }

    /// Four timepoints of 12³ voxels with a clipped corner in every frame.
    fn clipped_series() -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(21);
        let mut series = Array4::<f32>::zeros((4, 12, 12, 12));
        for mut frame in series.axis_iter_mut(Axis(0)) {
            frame.assign(&cube_frame(12, &mut rng));
            frame.slice_mut(s![..3, ..3, ..3]).fill(0.0);
        }
        series
    }

    #[test]
    fn rank_normalization_covers_supported_layouts() {
        assert_eq!(normalize_rank(&[8, 9], 1).unwrap(), [1, 1, 1, 8, 9]);
        assert_eq!(normalize_rank(&[4, 8, 9], 1).unwrap(), [1, 4, 1, 8, 9]);
        assert_eq!(normalize_rank(&[3, 4, 8, 9], 1).unwrap(), [3, 4, 1, 8, 9]);
        assert_eq!(normalize_rank(&[4, 2, 8, 9], 2).unwrap(), [1, 4, 2, 8, 9]);
        assert_eq!(normalize_rank(&[3, 4, 2, 8, 9], 2).unwrap(), [3, 4, 2, 8, 9]);
        assert_eq!(normalize_rank(&[3, 4, 1, 8, 9], 1).unwrap(), [3, 4, 1, 8, 9]);

        for (shape, channels) in [
            (vec![4, 8, 9], 2),
            (vec![4, 3, 8, 9], 2),
            (vec![3, 4, 1, 8, 9], 2),
            (vec![3, 4, 2, 8, 9], 1),
            (vec![9], 1),
            (vec![1, 2, 3, 4, 5, 6], 1),
        ] {
            assert!(
                matches!(normalize_rank(&shape, channels), Err(DeconError::ShapeMismatch(_))),
                "{shape:?} with {channels} channel(s) should be rejected"
            );
        }
    }

    #[test]
    fn restore_rank_undoes_normalization() {
        let shape = [3, 4, 8, 9];
        let canonical = normalize_rank(&shape, 1).unwrap();
        let volume = Array5::from_shape_fn(canonical, |(t, z, _, y, x)| (t + z + y + x) as f32);
        let restored = restore_rank(volume, &shape).unwrap();
        assert_eq!(restored.shape(), &shape);
        assert_eq!(restored[[2, 3, 7, 8]], 20.0);
    }

    #[test]
    fn iteration_schedule_sweeps_multiples_of_five() {
        assert_eq!(iteration_schedule(10, false), vec![10]);
        assert_eq!(iteration_schedule(10, true), vec![5, 10]);
        assert_eq!(iteration_schedule(12, true), vec![5, 10, 12]);
        assert_eq!(iteration_schedule(3, true), vec![3]);
    }

    #[test]
    fn end_to_end_cube_is_sharpened() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut input = Array4::<f32>::zeros((8, 32, 32, 32));
        for mut frame in input.axis_iter_mut(Axis(0)) {
            frame.assign(&cube_frame(32, &mut rng));
        }
        let input = input.into_dyn();

        let runner = runner(10, true, Some(1));
        let mut metadata = ImageMetadata {
            slices: 32,
            frames: 8,
            ..ImageMetadata::default()
        };
        let output = runner
            .run(input.view(), &[covariance([1.0, 1.0, 1.0])], &context(1), &mut metadata)
            .unwrap();

        assert_eq!(output.shape(), input.shape());
        assert!(output.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert_eq!(metadata.channels, 1);
        assert_eq!(metadata.images, 256);

        let cube = s![.., 12..20, 12..20, 12..20];
        let mean_in = input.slice(cube).mean().unwrap();
        let mean_out = output.slice(cube).mean().unwrap();
        assert!(
            mean_out > mean_in,
            "cube intensity {mean_out} not above blurred {mean_in}"
        );
    }

    #[test]
    fn seeded_runs_are_reproducible_in_both_modes() {
        let input = clipped_series().into_dyn();
        let psfs = [covariance([1.0, 1.0, 2.0])];
        let run = |parallel: bool| {
            runner(3, parallel, Some(77))
                .run(input.view(), &psfs, &context(1), &mut ImageMetadata::default())
                .unwrap()
        };
        let sequential = run(false);
        assert_eq!(sequential, run(false));
        assert_eq!(sequential, run(true));
    }

    #[test]
    fn channels_only_see_their_own_kernel() {
        let mut rng = StdRng::seed_from_u64(8);
        let frame = cube_frame(12, &mut rng);
        // (T, Z, C, Y, X) with the same frame in both channels
        let mut input = Array5::<f32>::zeros((2, 12, 2, 12, 12));
        for t in 0..2 {
            for c in 0..2 {
                input.slice_mut(s![t, .., c, .., ..]).assign(&frame);
            }
        }
        let input = input.into_dyn();
        let narrow = covariance([0.5, 0.5, 0.5]);
        let wide = covariance([2.0, 2.0, 2.0]);

        let runner = runner(3, true, Some(5));
        let mut metadata = ImageMetadata {
            channels: 2,
            ..ImageMetadata::default()
        };
        let forward = runner
            .run(input.view(), &[narrow.clone(), wide.clone()], &context(2), &mut metadata)
            .unwrap();
        let swapped = runner
            .run(input.view(), &[wide, narrow], &context(2), &mut metadata)
            .unwrap();

        assert_eq!(metadata.channels, 2);
        let channel = |v: &ArrayD<f32>, c: usize| v.index_axis(Axis(2), c).to_owned();
        assert_eq!(channel(&forward, 0), channel(&swapped, 1));
        assert_eq!(channel(&forward, 1), channel(&swapped, 0));
        assert_ne!(channel(&forward, 0), channel(&forward, 1));
    }

    #[test]
    fn raised_abort_flag_cancels_the_batch() {
        let input = clipped_series().into_dyn();
        for parallel in [false, true] {
            let abort = Arc::new(AtomicBool::new(true));
            let progress = Arc::new(RwLock::new(None));
            let runner = runner(2, parallel, Some(0))
                .with_abort_flag(Arc::clone(&abort))
                .with_progress_lock(Arc::clone(&progress));
            let mut metadata = ImageMetadata {
                images: 7,
                ..ImageMetadata::default()
            };
            let result = runner.run(
                input.view(),
                &[covariance([1.0, 1.0, 1.0])],
                &context(1),
                &mut metadata,
            );
            assert!(matches!(result, Err(DeconError::Cancelled)));
            assert_eq!(metadata.images, 7);
            assert_eq!(*progress.read().unwrap(), None);
        }
    }

    #[test]
    fn failing_slice_aborts_the_batch() {
        let mut input = clipped_series();
        input.index_axis_mut(Axis(0), 2).fill(0.0);
        let input = input.into_dyn();
        for parallel in [false, true] {
            let result = runner(2, parallel, Some(0)).run(
                input.view(),
                &[covariance([1.0, 1.0, 1.0])],
                &context(1),
                &mut ImageMetadata::default(),
            );
            assert!(matches!(result, Err(DeconError::EmptyForeground)));
        }
    }

    #[test]
    fn psf_count_must_match_channels() {
        let input = clipped_series().into_dyn();
        let result = runner(1, false, Some(0)).run(
            input.view(),
            &[covariance([1.0, 1.0, 1.0]), covariance([1.0, 1.0, 1.0])],
            &context(1),
            &mut ImageMetadata::default(),
        );
        assert!(matches!(result, Err(DeconError::ShapeMismatch(_))));
    }

    #[test]
    fn two_channel_stack_needs_two_channel_batch() {
        // (Z, C, Y, X) as read from a two-channel file
        let input = Array4::<f32>::from_elem((6, 2, 10, 10), 50.0).into_dyn();
        let mut metadata = ImageMetadata {
            images: 12,
            channels: 2,
            slices: 6,
            ..ImageMetadata::default()
        };
        for parallel in [false, true] {
            let result = runner(1, parallel, Some(0)).run(
                input.view(),
                &[covariance([1.0, 1.0, 1.0])],
                &context(1),
                &mut metadata,
            );
            assert!(matches!(result, Err(DeconError::ShapeMismatch(_))));
            assert_eq!(metadata.channels, 2);
            assert_eq!(metadata.images, 12);
        }
    }

    #[test]
    fn single_volume_keeps_its_rank() {
        let mut rng = StdRng::seed_from_u64(2);
        let input = cube_frame(10, &mut rng).into_dyn();
        let output = runner(2, false, Some(3))
            .run(
                input.view(),
                &[covariance([1.0, 1.0, 1.0])],
                &context(1),
                &mut ImageMetadata::default(),
            )
            .unwrap();
        assert_eq!(output.shape(), &[10, 10, 10]);
    }
}
