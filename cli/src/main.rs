use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use bnnfit_core::data::{self, Dataset};
use bnnfit_core::diagnostics::compute_diagnostics;
use bnnfit_core::model::BnnModel;
use bnnfit_core::predict;
use bnnfit_core::progress::{spawn_progress_thread, ProgressState};
use bnnfit_core::sampler::{self, SamplerConfig};

mod plot;

/// Feature dimension of the generated design matrix (bias, t, t²).
const D_X: usize = 3;
/// Observation noise used by the data generator.
const SIGMA_OBS: f64 = 0.05;
/// Grid size for the predictive curve.
const NUM_TEST: usize = 500;
/// Seed offset separating predictive RNG streams from chain streams.
const PREDICT_SEED_OFFSET: u64 = 1 << 32;

const PLOT_PATH: &str = "bnn_plot.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Device {
    Cpu,
    Gpu,
}

/// Fit a two-hidden-layer Bayesian neural network to a synthetic
/// regression problem with NUTS, then plot the posterior-predictive
/// mean and 90% band.
#[derive(Parser, Debug)]
#[command(name = "bnnfit", version, about)]
struct Cli {
    /// Posterior draws to retain per chain.
    #[arg(long, default_value_t = 2000)]
    num_samples: usize,

    /// Warmup (adaptation) iterations per chain, discarded.
    #[arg(long, default_value_t = 1000)]
    num_warmup: usize,

    /// Number of independent chains.
    #[arg(long, default_value_t = 1)]
    num_chains: usize,

    /// Number of training observations to generate.
    #[arg(long, default_value_t = 100)]
    num_data: usize,

    /// Width of each hidden layer.
    #[arg(long, default_value_t = 5)]
    num_hidden: usize,

    /// Compute device.
    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    device: Device,

    /// Worker threads for parallel chains (0 = all cores).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Base RNG seed; chain i uses seed + i.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if args.device == Device::Gpu {
        tracing::warn!("no GPU backend is built in; falling back to CPU");
    }

    tracing::info!(
        num_data = args.num_data,
        num_hidden = args.num_hidden,
        "generating synthetic regression data"
    );
    let ds = data::make_regression(args.num_data, D_X, SIGMA_OBS, NUM_TEST)
        .context("data generation")?;

    let model = BnnModel::new(D_X, args.num_hidden, 1).context("model construction")?;
    let graph = model
        .graph(&ds.x, Some(&ds.y))
        .context("building the model graph")?;
    tracing::info!(params = model.param_count(), "model graph built");

    let config = SamplerConfig {
        num_chains: args.num_chains,
        num_draws: args.num_samples,
        num_warmup: args.num_warmup,
        seed: args.seed,
        num_threads: args.threads,
        ..Default::default()
    };

    // Suppress the live bar on CI; the counters still run in-process.
    let show_progress = std::env::var_os("CI").is_none();
    let progress = show_progress.then(|| {
        Arc::new(ProgressState::new(
            args.num_chains,
            args.num_samples,
            args.num_warmup,
        ))
    });
    let bar = progress.clone().map(spawn_progress_thread);

    let t0 = Instant::now();
    let result = sampler::sample(graph, &config, progress.clone()).context("sampling")?;
    if let Some(p) = &progress {
        p.finish();
    }
    if let Some(handle) = bar {
        let _ = handle.join();
    }
    tracing::info!(
        elapsed_s = t0.elapsed().as_secs_f64(),
        divergences = result.divergences,
        "sampling complete"
    );

    let report = compute_diagnostics(&result);
    println!("{}", report.to_table());

    let draws = result.merged_constrained();
    tracing::info!(draws = draws.len(), points = NUM_TEST, "posterior predictive");
    let pred = predict::posterior_predictive(
        &model,
        &ds.x_test,
        &draws,
        args.seed.wrapping_add(PREDICT_SEED_OFFSET),
    )
    .context("posterior predictive")?;
    let band = predict::summarize(&pred, 0.05, 0.95);

    let (train, xs) = plot_coordinates(&ds);
    plot::render(PLOT_PATH, &train, &xs, &band).context("rendering the plot")?;
    tracing::info!(path = PLOT_PATH, "plot written");

    Ok(())
}

/// Pick the plotting coordinate: the linear column of the power basis,
/// or the only column when the design has no bias term.
fn plot_coordinates(ds: &Dataset) -> (Vec<(f64, f64)>, Vec<f64>) {
    let col = if ds.x.ncols() >= 2 { 1 } else { 0 };
    let train = ds
        .x
        .column(col)
        .iter()
        .zip(ds.y.column(0).iter())
        .map(|(&x, &y)| (x, y))
        .collect();
    let xs = ds.x_test.column(col).iter().copied().collect();
    (train, xs)
}
