use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use clap::Parser;
use model::PreActResNetConfig;
use module::celu::CeluConfig;
use schedule::LearningRateScheduleConfig;
use tracing_subscriber::EnvFilter;
use training::{reset_experiment, sgd_nesterov, train, TrainingConfig, EXPERIMENT_NAME};

pub mod checkpoint;
pub mod data;
pub mod metrics;
pub mod model;
pub mod module;
pub mod schedule;
pub mod training;

const LABELS: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Train a pre-activation ResNet-18 with CELU activations on CIFAR-10.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Initial learning rate
    #[arg(long, default_value_t = 0.01)]
    lr: f64,

    /// Directory holding `cifar-10-batches-bin/` or `train/` and `test/` image folders.
    /// The binary archive is downloaded here when neither is present
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Parent directory of the experiment's checkpoints and logs
    #[arg(long, default_value = "experiments")]
    experiments_dir: PathBuf,

    #[arg(long, default_value_t = 300)]
    epochs: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    #[arg(long, default_value_t = 100)]
    test_batch_size: usize,

    /// Data loader worker threads
    #[arg(long, default_value_t = 2)]
    workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Discard the previous run instead of resuming from its checkpoint
    #[arg(long)]
    fresh: bool,

    /// Fail instead of fetching the dataset when `--data-dir` holds none
    #[arg(long)]
    no_download: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let device = WgpuDevice::default();
    let experiment_dir = cli.experiments_dir.join(EXPERIMENT_NAME);

    if cli.fresh {
        reset_experiment(&experiment_dir)?;
    }

    let config = TrainingConfig::new(
        PreActResNetConfig::new(LABELS.len(), CeluConfig::new()),
        sgd_nesterov(),
        LearningRateScheduleConfig::new(cli.lr),
    )
    .with_epoch_count(cli.epochs)
    .with_batch_size(cli.batch_size)
    .with_test_batch_size(cli.test_batch_size)
    .with_worker_count(cli.workers)
    .with_seed(cli.seed)
    .with_download(!cli.no_download);

    train::<AutodiffBackend>(&experiment_dir, &cli.data_dir, config, device)?;

    Ok(())
}
