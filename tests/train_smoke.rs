//! End-to-end trainer behavior on a small synthetic dataset.
//!
//! These tests verify:
//! 1. The CREATED/INITIALIZED/TRAINING/COMPLETE state machine
//! 2. One metrics entry per epoch and a sane loss trajectory
//! 3. Checkpoint and property artifacts written by the listeners

use burn::backend::{ndarray::NdArray, Autodiff};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use mnist_lstm::dataset::{DatasetConfig, MnistData, MnistDataset};
use mnist_lstm::listener::{CheckpointListener, LoggingListener};
use mnist_lstm::metrics::Accuracy;
use mnist_lstm::model::{LstmClassifier, LstmClassifierConfig};
use mnist_lstm::training::{Model, Trainer, TrainerState, TrainingConfig, TrainingError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

type ADBackend = Autodiff<NdArray<f32>>;

/// Two linearly separable classes: constant dark images labeled 0 and
/// constant bright images labeled 1, 4x4 pixels each.
fn synthetic_data(count: usize) -> MnistData {
    let (rows, cols) = (4, 4);
    let mut images = Vec::with_capacity(count * rows * cols);
    let mut labels = Vec::with_capacity(count);
    for i in 0..count {
        let class = (i % 2) as i64;
        let value = if class == 0 { 0.05 } else { 0.95 };
        images.extend(std::iter::repeat(value).take(rows * cols));
        labels.push(class);
    }
    MnistData {
        images,
        labels,
        rows,
        cols,
    }
}

fn synthetic_dataset(count: usize, batch_size: usize) -> MnistDataset {
    MnistDataset::new(
        synthetic_data(count),
        DatasetConfig {
            batch_size,
            ..Default::default()
        },
    )
}

fn tiny_model_config() -> LstmClassifierConfig {
    LstmClassifierConfig {
        channels: Some(4),
        ..Default::default()
    }
}

fn tiny_trainer(config: TrainingConfig<ADBackend>) -> Trainer<ADBackend> {
    let model = Model::new("lstm", tiny_model_config());
    Trainer::new(model, config)
}

#[test]
fn zero_epochs_yield_empty_history() {
    let train = synthetic_dataset(16, 8);
    let validate = synthetic_dataset(16, 8);
    let mut trainer = tiny_trainer(TrainingConfig::new().with_evaluator(Accuracy::new()));
    trainer.initialize(&[8, 4, 4]).unwrap();

    let result = trainer.fit(&train, &validate, 0).unwrap();
    assert!(result.history.is_empty());
    assert_eq!(result.final_metrics(), None);
    assert_eq!(result.final_accuracy(), None);
    assert_eq!(result.best_accuracy(), None);
    assert_eq!(trainer.state(), TrainerState::Complete);
    // The network was still built by initialize.
    assert!(trainer.model().network().is_some());
}

#[test]
fn fit_records_one_entry_per_epoch() {
    let train = synthetic_dataset(64, 8);
    let validate = synthetic_dataset(16, 8);
    let mut trainer = tiny_trainer(
        TrainingConfig::new()
            .with_learning_rate(1e-2)
            .with_evaluator(Accuracy::new()),
    );
    trainer.initialize(&[8, 4, 4]).unwrap();

    let result = trainer.fit(&train, &validate, 3).unwrap();
    assert_eq!(result.epochs(), 3);
    for (i, metrics) in result.history.iter().enumerate() {
        assert_eq!(metrics.epoch, i);
        assert!(metrics.train_loss.is_finite());
        assert!(metrics.validate_loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.validate_accuracy));
    }
    // Separable constant inputs: the loss should trend down, generously.
    for pair in result.history.windows(2) {
        assert!(pair[1].train_loss <= pair[0].train_loss + 0.5);
    }
    let last = result.history.last().unwrap();
    assert_eq!(result.final_accuracy(), Some(last.validate_accuracy));
    assert_eq!(result.final_loss(), Some(last.validate_loss));
    let best = result
        .history
        .iter()
        .map(|m| m.validate_accuracy)
        .fold(f32::MIN, f32::max);
    assert_eq!(result.best_accuracy(), Some(best));
    assert_eq!(trainer.state(), TrainerState::Complete);
}

#[test]
fn fit_before_initialize_errors() {
    let train = synthetic_dataset(16, 8);
    let validate = synthetic_dataset(16, 8);
    let mut trainer = tiny_trainer(TrainingConfig::new());
    assert_eq!(trainer.model().config().channels, Some(4));
    assert!(trainer.model().network().is_none());

    let err = trainer.fit(&train, &validate, 1).unwrap_err();
    assert!(matches!(err, TrainingError::InvalidState { .. }));
}

#[test]
fn double_initialize_errors() {
    let mut trainer = tiny_trainer(TrainingConfig::new());
    trainer.initialize(&[8, 4, 4]).unwrap();
    let err = trainer.initialize(&[8, 4, 4]).unwrap_err();
    assert!(matches!(err, TrainingError::InvalidState { .. }));
}

#[test]
fn initialize_rejects_unfoldable_shape() {
    let model = Model::new(
        "lstm",
        LstmClassifierConfig {
            channels: Some(5),
            ..Default::default()
        },
    );
    let mut trainer = Trainer::<ADBackend>::new(model, TrainingConfig::new());
    let err = trainer.initialize(&[32, 28, 28]).unwrap_err();
    assert!(matches!(err, TrainingError::Shape(_)));
    assert_eq!(trainer.state(), TrainerState::Created);
}

fn read_properties(path: &Path) -> BTreeMap<String, String> {
    let raw = fs::read(path).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[test]
fn listeners_write_checkpoints_and_properties() {
    let temp = tempfile::tempdir().unwrap();
    let out_dir = temp.path().join("out");
    let train = synthetic_dataset(32, 8);
    let validate = synthetic_dataset(16, 8);
    let mut trainer = tiny_trainer(
        TrainingConfig::new()
            .with_evaluator(Accuracy::new())
            .with_listener(LoggingListener::with_file(out_dir.join("training.jsonl")))
            .with_listener(CheckpointListener::new(&out_dir)),
    );
    trainer.initialize(&[8, 4, 4]).unwrap();
    trainer.fit(&train, &validate, 2).unwrap();

    assert!(out_dir.join("lstm-0000.bin").exists());
    assert!(out_dir.join("lstm-0001.bin").exists());

    // Exactly one accuracy and one loss value, both with 5 decimals.
    let properties = read_properties(&out_dir.join("lstm.json"));
    assert_eq!(properties.len(), 2);
    for key in ["Accuracy", "Loss"] {
        let value = properties.get(key).unwrap();
        assert_eq!(value.split('.').nth(1).unwrap().len(), 5, "{key}={value}");
        value.parse::<f32>().unwrap();
    }
    assert_eq!(
        trainer.model().property("Accuracy"),
        properties.get("Accuracy").map(String::as_str)
    );
    // The persisted file mirrors the in-memory map.
    assert_eq!(trainer.model().properties(), &properties);

    // One JSONL record per epoch.
    let trace = fs::read_to_string(out_dir.join("training.jsonl")).unwrap();
    let lines: Vec<&str> = trace.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(record.get("epoch").is_some());
        assert!(record.get("validate_accuracy").is_some());
    }
}

#[test]
fn checkpoint_loads_back_into_inner_backend() {
    let temp = tempfile::tempdir().unwrap();
    let out_dir = temp.path().join("out");
    let train = synthetic_dataset(16, 8);
    let validate = synthetic_dataset(16, 8);
    let mut trainer = tiny_trainer(
        TrainingConfig::new()
            .with_evaluator(Accuracy::new())
            .with_listener(CheckpointListener::new(&out_dir)),
    );
    trainer.initialize(&[8, 4, 4]).unwrap();
    trainer.fit(&train, &validate, 1).unwrap();

    let device = Default::default();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let loaded = LstmClassifier::<NdArray<f32>>::new(tiny_model_config(), &device)
        .load_file(out_dir.join("lstm-0000.bin"), &recorder, &device)
        .expect("load checkpoint");
    let input = burn::tensor::Tensor::<NdArray<f32>, 3>::zeros([2, 4, 4], &device);
    let logits = loaded.forward_classify(input).unwrap();
    assert_eq!(logits.dims(), [2, 64]);
}
