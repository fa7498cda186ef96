//! Training listeners: epoch logging and checkpointing.

use crate::training::{EpochMetrics, Model, TrainingError};
use burn::tensor::backend::Backend;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Hook invoked after each epoch's evaluation pass.
pub trait TrainingListener<B: Backend> {
    fn on_epoch_end(
        &mut self,
        model: &mut Model<B>,
        metrics: &EpochMetrics,
    ) -> Result<(), TrainingError>;
}

/// Prints one line per epoch and optionally appends a JSONL record per epoch
/// to a trace file. Trace failures are reported once and disable the file.
pub struct LoggingListener {
    trace_path: Option<PathBuf>,
    trace_file: Option<fs::File>,
    started: Instant,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self {
            trace_path: None,
            trace_file: None,
            started: Instant::now(),
        }
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: Some(path.into()),
            trace_file: None,
            started: Instant::now(),
        }
    }

    fn maybe_trace(&mut self, metrics: &EpochMetrics) {
        let Some(path) = &self.trace_path else {
            return;
        };
        if self.trace_file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            match fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => self.trace_file = Some(f),
                Err(e) => {
                    eprintln!("Failed to open trace file {}: {e}", path.display());
                    self.trace_path = None;
                    return;
                }
            }
        }
        let Some(file) = self.trace_file.as_mut() else {
            return;
        };
        let record = serde_json::json!({
            "epoch": metrics.epoch,
            "train_loss": metrics.train_loss,
            "validate_loss": metrics.validate_loss,
            "validate_accuracy": metrics.validate_accuracy,
            "timestamp_ms": self.started.elapsed().as_millis() as u64
        });
        if let Err(e) = writeln!(file, "{}", record) {
            eprintln!("Failed to write trace record: {e}");
            self.trace_path = None;
            self.trace_file = None;
        }
    }
}

impl Default for LoggingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> TrainingListener<B> for LoggingListener {
    fn on_epoch_end(
        &mut self,
        _model: &mut Model<B>,
        metrics: &EpochMetrics,
    ) -> Result<(), TrainingError> {
        println!(
            "epoch {}: train loss {:.4}, validate loss {:.4}, accuracy {:.4}",
            metrics.epoch, metrics.train_loss, metrics.validate_loss, metrics.validate_accuracy
        );
        self.maybe_trace(metrics);
        Ok(())
    }
}

/// Writes an epoch-numbered checkpoint after every evaluation cycle and keeps
/// the best validation accuracy and its loss in the model properties.
pub struct CheckpointListener {
    output_dir: PathBuf,
    best_accuracy: Option<f32>,
}

impl CheckpointListener {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            best_accuracy: None,
        }
    }
}

impl<B: Backend> TrainingListener<B> for CheckpointListener {
    fn on_epoch_end(
        &mut self,
        model: &mut Model<B>,
        metrics: &EpochMetrics,
    ) -> Result<(), TrainingError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| TrainingError::Io {
            path: self.output_dir.clone(),
            source: e,
        })?;
        let checkpoint = self
            .output_dir
            .join(format!("{}-{:04}.bin", model.name(), metrics.epoch));
        model.save_checkpoint(&checkpoint)?;

        let improved = self
            .best_accuracy
            .is_none_or(|best| metrics.validate_accuracy > best);
        if improved {
            self.best_accuracy = Some(metrics.validate_accuracy);
            model.set_property("Accuracy", format!("{:.5}", metrics.validate_accuracy));
            model.set_property("Loss", format!("{:.5}", metrics.validate_loss));
        }
        model.persist_properties(&self.output_dir)?;
        Ok(())
    }
}
