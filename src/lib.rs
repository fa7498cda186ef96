#![recursion_limit = "256"]
//! LSTM digit classification on MNIST with Burn.
//!
//! This crate provides:
//! - MNIST fetch/decode with checksum verification and batch iteration
//! - An LSTM classifier folding each image into a (time, channel) sequence
//! - A trainer running an epoch/batch loop with per-epoch evaluation
//! - Logging and checkpoint listeners writing to an output directory

// Module declarations
pub mod cli;
pub mod dataset;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod training;

// Re-export public API
pub use cli::{validate_backend_choice, BackendKind, TrainArgs};
pub use dataset::{
    load_dataset, BatchIter, DatasetConfig, DatasetError, DatasetResult, MnistBatch, MnistData,
    MnistDataset, MnistSource, MnistUsage,
};
pub use listener::{CheckpointListener, LoggingListener, TrainingListener};
pub use metrics::{Accuracy, Evaluator};
pub use model::{
    fold_into_sequence, LstmClassifier, LstmClassifierConfig, SequenceShape, ShapeError,
};
pub use training::{
    devices, load_classifier_from_checkpoint, run_train, EpochMetrics, Model, Trainer,
    TrainerState, TrainingConfig, TrainingError, TrainingResult,
};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
