use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    config::Config,
    module::Module,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};

use crate::model::PreActResNet;

/// Full precision so a resumed run continues from bit-identical weights and momentum.
type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Bookkeeping stored next to the weights so a run can pick up where it stopped.
#[derive(Config, Debug, PartialEq)]
pub struct CheckpointState {
    pub epoch: usize,
    /// Test accuracy of `epoch`, in percent.
    pub accuracy: f64,
    pub best_accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Overwritten after every epoch.
    Current,
    /// Overwritten when test accuracy improves.
    Best,
}

impl Slot {
    fn stem(&self) -> &'static str {
        match self {
            Slot::Current => "checkpoint",
            Slot::Best => "checkpoint_best",
        }
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create checkpoint directory {}", dir.display())
        })?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}-model", slot.stem()))
    }

    fn optimizer_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}-optim", slot.stem()))
    }

    fn state_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}.json", slot.stem()))
    }

    /// The state file is written last, so its presence marks a complete checkpoint.
    pub fn exists(&self, slot: Slot) -> bool {
        self.state_path(slot).is_file()
    }

    pub fn save<B, O>(
        &self,
        slot: Slot,
        model: &PreActResNet<B>,
        optimizer: &O,
        state: &CheckpointState,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<PreActResNet<B>, B>,
    {
        let recorder = CheckpointRecorder::new();

        model
            .clone()
            .save_file(self.model_path(slot), &recorder)
            .map_err(|err| anyhow!("failed to save {:?} model: {err:?}", slot))?;

        Recorder::<B>::record(&recorder, optimizer.to_record(), self.optimizer_path(slot))
            .map_err(|err| anyhow!("failed to save {:?} optimizer: {err:?}", slot))?;

        state
            .save(self.state_path(slot))
            .with_context(|| format!("failed to save {:?} checkpoint state", slot))?;

        tracing::debug!("Saved {:?} checkpoint at epoch {}", slot, state.epoch);
        Ok(())
    }

    /// Restores model weights, optimizer state and bookkeeping from `slot`.
    pub fn load<B, O>(
        &self,
        slot: Slot,
        model: PreActResNet<B>,
        optimizer: O,
        device: &B::Device,
    ) -> Result<(PreActResNet<B>, O, CheckpointState)>
    where
        B: AutodiffBackend,
        O: Optimizer<PreActResNet<B>, B>,
    {
        ensure!(
            self.exists(slot),
            "no {:?} checkpoint in {}",
            slot,
            self.dir.display()
        );

        let recorder = CheckpointRecorder::new();

        let state = CheckpointState::load(self.state_path(slot))
            .map_err(|err| anyhow!("failed to read {:?} checkpoint state: {err:?}", slot))?;

        let model = model
            .load_file(self.model_path(slot), &recorder, device)
            .map_err(|err| anyhow!("failed to load {:?} model: {err:?}", slot))?;

        let record: O::Record =
            Recorder::<B>::load(&recorder, self.optimizer_path(slot), device)
                .map_err(|err| anyhow!("failed to load {:?} optimizer: {err:?}", slot))?;

        Ok((model, optimizer.load_record(record), state))
    }
}
