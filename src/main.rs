use clap::Parser;
use flexi_logger::Logger;
use rl_decon::batch::iteration_schedule;
use rl_decon::data_container::{to_u16_volume, BatchContext};
use rl_decon::io::{output_path, read_hyperstack, read_psf, write_hyperstack};
use rl_decon::{ComputeBackend, CpuBackend, DeconConfig, DeconError, Result, VolumeBatchRunner};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "rl-decon", version)]
#[command(about = "Richardson-Lucy deconvolution of ImageJ hyperstacks")]
struct Args {
    /// Acquisitions to deconvolve (ImageJ TIFF files)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// PSF of each channel, in channel order (.csv covariance matrix or .npy kernel)
    #[arg(long = "psf", required = true)]
    psfs: Vec<PathBuf>,

    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    iterations: Option<usize>,

    /// Reflected border added on every side in direct-space mode
    #[arg(long)]
    pad: Option<usize>,

    /// Z-spacing used to rescale the PSF (default: 10x the file spacing)
    #[arg(long)]
    z_spacing: Option<f64>,

    /// Number of channels (default: one per PSF)
    #[arg(long)]
    channels: Option<usize>,

    /// Use the frequency-domain solver
    #[arg(long)]
    otf: bool,

    /// Enable regularization with this constant (frequency-domain solver)
    #[arg(long)]
    regularization: Option<f32>,

    /// Enable the low-pass cutoff at this fraction of the maximum frequency
    #[arg(long)]
    cutoff: Option<f32>,

    /// Stop once the change drops below this fraction of the first change
    #[arg(long)]
    convergence_ratio: Option<f32>,

    /// Seed of the background noise
    #[arg(long)]
    seed: Option<u64>,

    /// Process timepoints one after the other
    #[arg(long)]
    sequential: bool,

    /// Write one result for every multiple of 5 iterations
    #[arg(long)]
    sweep: bool,

    /// Size of the worker thread pool (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<DeconConfig> {
    let mut config = match &args.config {
        Some(path) => DeconConfig::load(path)?,
        None => DeconConfig {
            channel_count: args.psfs.len(),
            ..DeconConfig::default()
        },
    };
    if let Some(iterations) = args.iterations {
        config.solver.iterations = iterations;
    }
    if let Some(pad) = args.pad {
        config.solver.pad_amount = pad;
    }
    if let Some(z_spacing) = args.z_spacing {
        config.z_spacing = Some(z_spacing);
    }
    if let Some(channels) = args.channels {
        config.channel_count = channels;
    }
    if args.otf {
        config.solver.use_otf = true;
    }
    if let Some(constant) = args.regularization {
        config.solver.use_regularization = true;
        config.solver.regularization_constant = constant;
    }
    if let Some(cutoff) = args.cutoff {
        config.solver.use_cutoff = true;
        config.solver.cutoff_frequency = cutoff;
    }
    if args.convergence_ratio.is_some() {
        config.solver.convergence_ratio = args.convergence_ratio;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.sequential {
        config.parallel = false;
    }
    if args.sweep {
        config.iteration_sweep = true;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| DeconError::InvalidConfig(err.to_string()))?;
    }

    let psfs = args
        .psfs
        .iter()
        .map(|path| read_psf(path))
        .collect::<Result<Vec<_>>>()?;
    let backend: Arc<dyn ComputeBackend> = Arc::new(CpuBackend::new());
    log::info!(
        "{} file(s), {} channel(s), compute backend {}",
        args.inputs.len(),
        config.channel_count,
        backend.name()
    );

    for input in &args.inputs {
        let stack = read_hyperstack(input)?;
        let context = BatchContext {
            channel_count: config.channel_count,
            z_spacing: config.resolve_z_spacing(stack.metadata.spacing),
        };
        log::info!("{input:?}: PSF z-spacing {}", context.z_spacing);

        for iterations in iteration_schedule(config.solver.iterations, config.iteration_sweep) {
            let start = Instant::now();
            let mut run_config = config.clone();
            run_config.solver.iterations = iterations;
            let runner = VolumeBatchRunner::new(&run_config, Arc::clone(&backend))?;

            let mut metadata = stack.metadata.clone();
            let restored = runner.run(stack.data.view(), &psfs, &context, &mut metadata)?;

            let output = output_path(input, iterations, run_config.solver.pad_amount);
            write_hyperstack(&output, &to_u16_volume(&restored), &metadata, stack.resolution)?;
            log::info!(
                "{iterations} iteration(s) written to {output:?} in {:.1} s",
                start.elapsed().as_secs_f32()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _logger = match Logger::try_with_env_or_str(&args.log_level).and_then(|l| l.start()) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("logger initialization failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
