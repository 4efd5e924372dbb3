use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};

use anyhow::{Context, Result};

const HEADER: &str = "epoch,loss,acc";

/// Running loss and accuracy over the batches of one pass.
#[derive(Debug, Default, Clone)]
pub struct EpochAccumulator {
    loss_sum: f64,
    batch_count: usize,
    correct: usize,
    total: usize,
}

impl EpochAccumulator {
    pub fn update(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss;
        self.batch_count += 1;
        self.correct += correct;
        self.total += batch_size;
    }

    /// Mean of the batch losses.
    pub fn loss(&self) -> f64 {
        if self.batch_count == 0 {
            return 0.0;
        }
        self.loss_sum / self.batch_count as f64
    }

    /// Accuracy in percent.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.correct as f64 / self.total as f64
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

impl EpochRecord {
    pub fn new(epoch: usize, accumulator: &EpochAccumulator) -> Self {
        Self {
            epoch,
            loss: accumulator.loss(),
            accuracy: accumulator.accuracy(),
        }
    }
}

/// Append-only per-epoch CSV log. Survives restarts: the header is only
/// written when the file is first created.
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &EpochRecord) -> Result<()> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&self.path, format!("{HEADER}\n"))
                .with_context(|| format!("failed to create {}", self.path.display()))?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        writeln!(file, "{},{},{}", record.epoch, record.loss, record.accuracy)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        tracing::debug!("Logged epoch {} to {}", record.epoch, self.path.display());
        Ok(())
    }
}
