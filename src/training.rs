//! Training driver: config assembly, the trainer state machine, and the
//! epoch/batch fit loop.
//!
//! The trainer binds a [`Model`] to a [`TrainingConfig`], validates the
//! declared input shape on initialization, then runs forward/backward/step
//! over the training set and a full evaluation pass per epoch. Any batch
//! error aborts the run and propagates; there is no retry or resume.

use crate::cli::{validate_backend_choice, TrainArgs};
use crate::dataset::{
    load_dataset, DatasetConfig, DatasetError, MnistDataset, MnistSource, MnistUsage,
    MNIST_IMAGE_COLS, MNIST_IMAGE_ROWS,
};
use crate::listener::{CheckpointListener, LoggingListener, TrainingListener};
use crate::metrics::{Accuracy, Evaluator};
use crate::model::{fold_into_sequence, LstmClassifier, LstmClassifierConfig, ShapeError};
use crate::TrainBackend;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::nn;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("trainer is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: TrainerState,
        actual: TrainerState,
    },
    #[error("model network not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Created,
    Initialized,
    Training,
    Complete,
}

/// Metrics snapshot for one completed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub validate_loss: f32,
    pub validate_accuracy: f32,
}

/// Final outcome of a fit run: one metrics entry per completed epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingResult {
    pub history: Vec<EpochMetrics>,
}

impl TrainingResult {
    pub fn epochs(&self) -> usize {
        self.history.len()
    }

    pub fn final_metrics(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }

    pub fn final_accuracy(&self) -> Option<f32> {
        self.final_metrics().map(|m| m.validate_accuracy)
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.final_metrics().map(|m| m.validate_loss)
    }

    pub fn best_accuracy(&self) -> Option<f32> {
        self.history
            .iter()
            .map(|m| m.validate_accuracy)
            .fold(None, |best, v| match best {
                Some(b) if b >= v => Some(b),
                _ => Some(v),
            })
    }
}

/// Network plus its string properties. The network is built lazily by
/// [`Trainer::initialize`]; properties are written once by the checkpoint
/// listener at the end of each evaluation cycle.
pub struct Model<B: Backend> {
    name: String,
    config: LstmClassifierConfig,
    net: Option<LstmClassifier<B>>,
    properties: BTreeMap<String, String>,
}

impl<B: Backend> Model<B> {
    pub fn new(name: impl Into<String>, config: LstmClassifierConfig) -> Self {
        Self {
            name: name.into(),
            config,
            net: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LstmClassifierConfig {
        &self.config
    }

    pub fn network(&self) -> Option<&LstmClassifier<B>> {
        self.net.as_ref()
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Write the properties map as pretty JSON to `<dir>/<name>.json`.
    pub fn persist_properties(&self, dir: &Path) -> Result<(), TrainingError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| TrainingError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        let path = dir.join(format!("{}.json", self.name));
        let data = serde_json::to_vec_pretty(&self.properties).map_err(|e| TrainingError::Json {
            path: path.clone(),
            source: e,
        })?;
        fs::write(&path, data).map_err(|e| TrainingError::Io {
            path,
            source: e,
        })
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<(), TrainingError> {
        let net = self.net.clone().ok_or(TrainingError::NotInitialized)?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        net.save_file(path, &recorder)?;
        Ok(())
    }
}

/// Everything the trainer needs besides the model: loss, optimizer,
/// initializer, devices, evaluators, and listeners. Training itself runs on
/// the first device; the full set is kept for reporting.
pub struct TrainingConfig<B: AutodiffBackend> {
    pub loss: CrossEntropyLossConfig,
    pub optimizer: AdamConfig,
    pub initializer: nn::Initializer,
    pub learning_rate: f64,
    pub devices: Vec<B::Device>,
    pub evaluators: Vec<Box<dyn Evaluator<B::InnerBackend>>>,
    pub listeners: Vec<Box<dyn TrainingListener<B>>>,
}

impl<B: AutodiffBackend> TrainingConfig<B> {
    pub fn new() -> Self {
        Self {
            loss: CrossEntropyLossConfig::new(),
            optimizer: AdamConfig::new(),
            initializer: nn::Initializer::XavierUniform { gain: 1.0 },
            learning_rate: 1e-3,
            devices: vec![B::Device::default()],
            evaluators: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_loss(mut self, loss: CrossEntropyLossConfig) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_optimizer(mut self, optimizer: AdamConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_initializer(mut self, initializer: nn::Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_devices(mut self, devices: Vec<B::Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_evaluator(mut self, evaluator: impl Evaluator<B::InnerBackend> + 'static) -> Self {
        self.evaluators.push(Box::new(evaluator));
        self
    }

    pub fn with_listener(mut self, listener: impl TrainingListener<B> + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }
}

impl<B: AutodiffBackend> Default for TrainingConfig<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs CREATED -> INITIALIZED -> TRAINING -> COMPLETE. `initialize` binds
/// the declared input shape and builds the network; `fit` consumes epochs.
pub struct Trainer<B: AutodiffBackend> {
    model: Model<B>,
    config: TrainingConfig<B>,
    state: TrainerState,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(model: Model<B>, config: TrainingConfig<B>) -> Self {
        Self {
            model,
            config,
            state: TrainerState::Created,
            device: B::Device::default(),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &Model<B> {
        &self.model
    }

    /// Bind the trainer to a concrete input shape and build the network on
    /// the first configured device. Fails if the shape cannot fold into a
    /// (batch, time, channel) sequence.
    pub fn initialize(&mut self, input_shape: &[usize]) -> Result<(), TrainingError> {
        if self.state != TrainerState::Created {
            return Err(TrainingError::InvalidState {
                expected: TrainerState::Created,
                actual: self.state,
            });
        }
        let channels = self.model.config.channels.unwrap_or(MNIST_IMAGE_COLS);
        fold_into_sequence(input_shape, Some(channels))?;
        self.device = self.config.devices.first().cloned().unwrap_or_default();
        let net = LstmClassifier::with_initializer(
            self.model.config.clone(),
            self.config.initializer.clone(),
            &self.device,
        );
        self.model.net = Some(net);
        self.state = TrainerState::Initialized;
        Ok(())
    }

    /// Fixed-epoch fit loop: each epoch trains over all batches, then runs a
    /// full evaluation pass and notifies the listeners.
    pub fn fit(
        &mut self,
        train: &MnistDataset,
        validate: &MnistDataset,
        epochs: usize,
    ) -> Result<TrainingResult, TrainingError> {
        if self.state != TrainerState::Initialized {
            return Err(TrainingError::InvalidState {
                expected: TrainerState::Initialized,
                actual: self.state,
            });
        }
        self.state = TrainerState::Training;

        let device = self.device.clone();
        let criterion = self.config.loss.init(&device);
        let valid_criterion: CrossEntropyLoss<B::InnerBackend> = self.config.loss.init(&device);
        let mut optim = self.config.optimizer.init();
        let mut net = self.model.net.take().ok_or(TrainingError::NotInitialized)?;
        let mut history = Vec::new();

        for epoch in 0..epochs {
            let mut losses = Vec::new();
            let mut iter = train.iter();
            while let Some(batch) = iter.next_batch::<B>(&device) {
                let logits = net.forward_classify(batch.images)?;
                let loss = criterion.forward(logits, batch.targets);
                let loss_detached = loss.clone().detach();
                let grads = GradientsParams::from_grads(loss.backward(), &net);
                net = optim.step(self.config.learning_rate, net, grads);

                let loss_val: f32 = loss_detached
                    .into_data()
                    .to_vec::<f32>()
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or(0.0);
                losses.push(loss_val);
            }
            let train_loss = if losses.is_empty() {
                0.0
            } else {
                losses.iter().sum::<f32>() / losses.len() as f32
            };

            let valid_net = net.valid();
            for evaluator in &mut self.config.evaluators {
                evaluator.reset();
            }
            let mut valid_losses = Vec::new();
            let mut valid_iter = validate.iter();
            while let Some(batch) = valid_iter.next_batch::<B::InnerBackend>(&device) {
                let logits = valid_net.forward_classify(batch.images)?;
                let loss = valid_criterion.forward(logits.clone(), batch.targets.clone());
                let loss_val: f32 = loss
                    .into_data()
                    .to_vec::<f32>()
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or(0.0);
                valid_losses.push(loss_val);
                for evaluator in &mut self.config.evaluators {
                    evaluator.update(&logits, &batch.targets);
                }
            }
            let validate_loss = if valid_losses.is_empty() {
                0.0
            } else {
                valid_losses.iter().sum::<f32>() / valid_losses.len() as f32
            };
            let validate_accuracy = self
                .config
                .evaluators
                .first()
                .map(|e| e.value())
                .unwrap_or(0.0);

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                validate_loss,
                validate_accuracy,
            };
            self.model.net = Some(net);
            for listener in self.config.listeners.iter_mut() {
                listener.on_epoch_end(&mut self.model, &metrics)?;
            }
            net = self.model.net.take().ok_or(TrainingError::NotInitialized)?;
            history.push(metrics);
        }

        self.model.net = Some(net);
        self.state = TrainerState::Complete;
        Ok(TrainingResult { history })
    }
}

type ADBackend = Autodiff<TrainBackend>;

/// Device set for the requested GPU count. Without the wgpu backend this is
/// always the CPU; a non-zero request is reported and ignored.
#[cfg(not(feature = "backend-wgpu"))]
pub fn devices(max_gpus: usize) -> Vec<burn_ndarray::NdArrayDevice> {
    if max_gpus > 0 {
        eprintln!("[train] no GPU backend built; falling back to CPU");
    }
    vec![burn_ndarray::NdArrayDevice::default()]
}

/// Device set for the requested GPU count; zero falls back to the CPU
/// adapter.
#[cfg(feature = "backend-wgpu")]
pub fn devices(max_gpus: usize) -> Vec<burn_wgpu::WgpuDevice> {
    if max_gpus == 0 {
        vec![burn_wgpu::WgpuDevice::Cpu]
    } else {
        (0..max_gpus).map(burn_wgpu::WgpuDevice::DiscreteGpu).collect()
    }
}

#[cfg(test)]
mod device_tests {
    use super::devices;

    #[cfg(not(feature = "backend-wgpu"))]
    #[test]
    fn zero_gpus_selects_cpu() {
        assert_eq!(devices(0), vec![burn_ndarray::NdArrayDevice::default()]);
    }

    #[cfg(feature = "backend-wgpu")]
    #[test]
    fn zero_gpus_selects_cpu() {
        assert_eq!(devices(0), vec![burn_wgpu::WgpuDevice::Cpu]);
    }

    #[cfg(feature = "backend-wgpu")]
    #[test]
    fn gpu_request_enumerates_discrete_devices() {
        assert_eq!(
            devices(2),
            vec![
                burn_wgpu::WgpuDevice::DiscreteGpu(0),
                burn_wgpu::WgpuDevice::DiscreteGpu(1)
            ]
        );
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainingResult> {
    validate_backend_choice(args.backend)?;
    if let Some(seed) = args.seed {
        ADBackend::seed(seed);
    }

    let source = MnistSource::new(&args.data_dir);
    let batch_size = args.batch_size.max(1);
    let dataset_cfg = DatasetConfig {
        batch_size,
        limit: args.limit,
        ..Default::default()
    };
    let train = load_dataset(MnistUsage::Training, &source, dataset_cfg.clone())?;
    let validate = load_dataset(MnistUsage::Test, &source, dataset_cfg)?;

    let model = Model::new("lstm", LstmClassifierConfig::default());
    let config = TrainingConfig::<ADBackend>::new()
        .with_learning_rate(args.lr as f64)
        .with_devices(devices(args.max_gpus))
        .with_evaluator(Accuracy::new())
        .with_listener(LoggingListener::with_file(
            args.output_dir.join("training.jsonl"),
        ))
        .with_listener(CheckpointListener::new(&args.output_dir));

    let mut trainer = Trainer::new(model, config);
    trainer.initialize(&[32, MNIST_IMAGE_ROWS, MNIST_IMAGE_COLS])?;
    let result = trainer.fit(&train, &validate, args.epochs)?;

    match result.final_metrics() {
        Some(m) => println!(
            "training complete: accuracy {:.5}, loss {:.5}",
            m.validate_accuracy, m.validate_loss
        ),
        None => println!("training complete: no epochs run"),
    }
    println!("artifacts in {}", args.output_dir.display());
    Ok(result)
}

pub fn load_classifier_from_checkpoint<P: AsRef<Path>>(
    path: P,
    device: &<TrainBackend as Backend>::Device,
) -> Result<LstmClassifier<TrainBackend>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    LstmClassifier::<TrainBackend>::new(LstmClassifierConfig::default(), device).load_file(
        path.as_ref(),
        &recorder,
        device,
    )
}
