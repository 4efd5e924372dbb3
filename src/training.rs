use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::{
    checkpoint::{CheckpointState, CheckpointStore, Slot},
    data::{Cifar10Batch, Cifar10Batcher, Cifar10Dataset},
    metrics::{CsvLog, EpochAccumulator, EpochRecord},
    model::{PreActResNet, PreActResNetConfig},
    schedule::LearningRateScheduleConfig,
};

pub const EXPERIMENT_NAME: &str = "Preact_ResNet_18_CELU";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: PreActResNetConfig,

    pub optimizer: SgdConfig,

    pub schedule: LearningRateScheduleConfig,

    #[config(default = 300)]
    pub epoch_count: usize,

    #[config(default = 128)]
    pub batch_size: usize,

    #[config(default = 100)]
    pub test_batch_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 2)]
    pub worker_count: usize,

    /// Batches between progress lines during training.
    #[config(default = 100)]
    pub log_interval: usize,

    /// Fetch the CIFAR-10 archive when the data directory has no dataset.
    #[config(default = true)]
    pub download: bool,
}

/// SGD with Nesterov momentum 0.9 and weight decay 5e-4.
pub fn sgd_nesterov() -> SgdConfig {
    SgdConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(5e-4)))
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(0.9)
                .with_dampening(0.0)
                .with_nesterov(true),
        ))
}

pub fn reset_experiment(experiment_dir: &Path) -> Result<()> {
    if experiment_dir.exists() {
        tracing::info!("Removing previous run in {}", experiment_dir.display());
        fs::remove_dir_all(experiment_dir)
            .with_context(|| format!("failed to remove {}", experiment_dir.display()))?;
    }
    Ok(())
}

fn correct_count<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    output
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

fn train_epoch<B, O>(
    mut model: PreActResNet<B>,
    optimizer: &mut O,
    dataloader: &Arc<dyn DataLoader<Cifar10Batch<B>>>,
    learning_rate: f64,
    epoch: usize,
    log_interval: usize,
) -> (PreActResNet<B>, EpochAccumulator)
where
    B: AutodiffBackend,
    O: Optimizer<PreActResNet<B>, B>,
{
    let mut accumulator = EpochAccumulator::default();

    for (iteration, batch) in dataloader.iter().enumerate() {
        let output = model.forward_classification(batch.images, batch.targets);
        let batch_size = output.targets.dims()[0];
        let loss = output.loss;

        accumulator.update(
            loss.clone().into_scalar().elem::<f64>(),
            correct_count(output.output, output.targets),
            batch_size,
        );

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(learning_rate, model, grads);

        if log_interval > 0 && iteration % log_interval == 0 {
            tracing::info!(
                "Epoch: {} | Batch_idx: {} | Loss: ({:.4}) | Acc: ({:.2}%) ({}/{})",
                epoch,
                iteration,
                accumulator.loss(),
                accumulator.accuracy(),
                accumulator.correct(),
                accumulator.total(),
            );
        }
    }

    (model, accumulator)
}

/// Writes the current slot, and the best slot when `accuracy` strictly beats
/// `best_accuracy`. Returns whether the best slot was written.
fn save_checkpoints<B, O>(
    store: &CheckpointStore,
    model: &PreActResNet<B>,
    optimizer: &O,
    epoch: usize,
    accuracy: f64,
    best_accuracy: &mut f64,
) -> Result<bool>
where
    B: AutodiffBackend,
    O: Optimizer<PreActResNet<B>, B>,
{
    let improved = accuracy > *best_accuracy;
    if improved {
        *best_accuracy = accuracy;
    }

    let state = CheckpointState::new(epoch, accuracy, *best_accuracy);
    store.save(Slot::Current, model, optimizer, &state)?;

    if improved {
        tracing::info!("Saving best checkpoint ({:.2}%)", accuracy);
        store.save(Slot::Best, model, optimizer, &state)?;
    }

    Ok(improved)
}

/// Runs the test split through `model` without gradient tracking.
fn evaluate<B: Backend>(
    model: &PreActResNet<B>,
    dataloader: &Arc<dyn DataLoader<Cifar10Batch<B>>>,
) -> EpochAccumulator {
    let mut accumulator = EpochAccumulator::default();

    for batch in dataloader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        let batch_size = output.targets.dims()[0];

        accumulator.update(
            output.loss.into_scalar().elem::<f64>(),
            correct_count(output.output, output.targets),
            batch_size,
        );
    }

    accumulator
}

/// Trains until `config.epoch_count`, resuming from the current checkpoint in
/// `experiment_dir` when there is one.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    data_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<PreActResNet<B>> {
    let store = CheckpointStore::create(experiment_dir.join("checkpoint"))?;

    config
        .save(experiment_dir.join("config.json"))
        .with_context(|| format!("failed to save config in {}", experiment_dir.display()))?;

    B::seed(config.seed);

    tracing::info!("Preparing data");
    let (train, test) = Cifar10Dataset::load(data_dir, config.download)?;
    tracing::info!("Train data: {}", train.len());
    tracing::info!("Test data: {}", test.len());

    let dataloader_train = DataLoaderBuilder::new(Cifar10Batcher::<B>::train(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.worker_count)
        .build(train);

    let batcher_test = Cifar10Batcher::<B::InnerBackend>::test(device.clone());
    let dataloader_test = DataLoaderBuilder::new(batcher_test)
        .batch_size(config.test_batch_size)
        .num_workers(config.worker_count)
        .build(test);

    let model = config.model.init::<B>(&device);
    tracing::info!(
        "Built model {EXPERIMENT_NAME} with {} residual blocks",
        model.block_count()
    );
    let optimizer = config.optimizer.init::<B, PreActResNet<B>>();

    let resume = store.exists(Slot::Current);
    let (mut model, mut optimizer, start_epoch, mut best_accuracy) = if resume {
        tracing::info!("Resuming from checkpoint in {}", store.dir().display());
        let (model, optimizer, state) = store.load(Slot::Current, model, optimizer, &device)?;
        tracing::info!(
            "Restored epoch {} (accuracy {:.2}%, best {:.2}%)",
            state.epoch,
            state.accuracy,
            state.best_accuracy
        );
        (model, optimizer, state.epoch + 1, state.best_accuracy)
    } else {
        (model, optimizer, 0, 0.0)
    };

    let train_log = CsvLog::new(experiment_dir.join("train_log.csv"));
    let test_log = CsvLog::new(experiment_dir.join("test_log.csv"));

    for epoch in start_epoch..config.epoch_count {
        let learning_rate = config.schedule.learning_rate(epoch);
        tracing::info!("Epoch: {epoch} | Learning rate: {learning_rate:e}");

        let (trained, train_metrics) = train_epoch(
            model,
            &mut optimizer,
            &dataloader_train,
            learning_rate,
            epoch,
            config.log_interval,
        );
        model = trained;

        let test_metrics = evaluate(&model.valid(), &dataloader_test);
        tracing::info!(
            "# TEST : Loss: ({:.4}) | Acc: ({:.2}%) ({}/{})",
            test_metrics.loss(),
            test_metrics.accuracy(),
            test_metrics.correct(),
            test_metrics.total(),
        );

        let train_record = EpochRecord::new(epoch, &train_metrics);
        let test_record = EpochRecord::new(epoch, &test_metrics);
        train_log.append(&train_record)?;
        test_log.append(&test_record)?;

        save_checkpoints(
            &store,
            &model,
            &optimizer,
            epoch,
            test_record.accuracy,
            &mut best_accuracy,
        )?;
    }

    tracing::info!("Training finished, best test accuracy {:.2}%", best_accuracy);
    Ok(model)
}
