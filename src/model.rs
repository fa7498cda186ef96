//! Burn modules for the MNIST LSTM classifier.
//!
//! The network is a fixed sequential stack: fold the image grid into a
//! (batch, time, channel) sequence, run it through stacked LSTM layers, then
//! batch-normalize the hidden states. Classification reads the final time
//! step straight off the normalized sequence; there is no extra head.

use crate::dataset::MNIST_IMAGE_COLS;
use burn::module::Module;
use burn::nn;
use burn::tensor::Tensor;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("input needs a batch axis plus data axes, got {rank} dims")]
    MissingAxes { rank: usize },
    #[error("channel size {channels} does not divide flattened size {flat}")]
    Indivisible { flat: usize, channels: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceShape {
    pub batch: usize,
    pub time: usize,
    pub channels: usize,
}

/// Fold everything after the batch axis into (time, channel). The channel
/// count defaults to the input's last dimension and must divide the
/// flattened size exactly.
pub fn fold_into_sequence(
    dims: &[usize],
    channels: Option<usize>,
) -> Result<SequenceShape, ShapeError> {
    if dims.len() < 2 {
        return Err(ShapeError::MissingAxes { rank: dims.len() });
    }
    let batch = dims[0];
    let flat: usize = dims[1..].iter().product();
    let channels = channels.unwrap_or(dims[dims.len() - 1]);
    if channels == 0 || flat % channels != 0 {
        return Err(ShapeError::Indivisible { flat, channels });
    }
    Ok(SequenceShape {
        batch,
        time: flat / channels,
        channels,
    })
}

#[derive(Debug, Clone)]
pub struct LstmClassifierConfig {
    pub state_size: usize,
    pub stacked_layers: usize,
    pub dropout: f64,
    pub epsilon: f64,
    pub momentum: f64,
    /// Channel axis for the fold; defaults to the MNIST column count.
    pub channels: Option<usize>,
}

impl Default for LstmClassifierConfig {
    fn default() -> Self {
        Self {
            state_size: 64,
            stacked_layers: 1,
            dropout: 0.0,
            epsilon: 1e-5,
            momentum: 0.9,
            channels: None,
        }
    }
}

#[derive(Debug, Module)]
pub struct LstmClassifier<B: burn::tensor::backend::Backend> {
    layers: Vec<nn::Lstm<B>>,
    dropout: nn::Dropout,
    norm: nn::BatchNorm<B, 1>,
    channels: usize,
}

impl<B: burn::tensor::backend::Backend> LstmClassifier<B> {
    pub fn new(cfg: LstmClassifierConfig, device: &B::Device) -> Self {
        Self::with_initializer(cfg, nn::Initializer::XavierUniform { gain: 1.0 }, device)
    }

    pub fn with_initializer(
        cfg: LstmClassifierConfig,
        initializer: nn::Initializer,
        device: &B::Device,
    ) -> Self {
        let channels = cfg.channels.unwrap_or(MNIST_IMAGE_COLS);
        let mut layers = Vec::new();
        for i in 0..cfg.stacked_layers.max(1) {
            let d_input = if i == 0 { channels } else { cfg.state_size };
            layers.push(
                nn::LstmConfig::new(d_input, cfg.state_size, true)
                    .with_initializer(initializer.clone())
                    .init(device),
            );
        }
        let dropout = nn::DropoutConfig::new(cfg.dropout).init();
        let norm = nn::BatchNormConfig::new(cfg.state_size)
            .with_epsilon(cfg.epsilon)
            .with_momentum(cfg.momentum)
            .init(device);
        Self {
            layers,
            dropout,
            norm,
            channels,
        }
    }

    /// Full sequence pass: fold, LSTM stack, batch norm over the hidden
    /// features. Returns (batch, time, state_size).
    pub fn forward(&self, input: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let shape = fold_into_sequence(&input.dims(), Some(self.channels))?;
        let mut x = input.reshape([shape.batch, shape.time, shape.channels]);
        for lstm in &self.layers {
            let (out, _state) = lstm.forward(x, None);
            x = self.dropout.forward(out);
        }
        // BatchNorm wants (batch, features, time); features are the hidden units.
        let x = x.swap_dims(1, 2);
        let x = self.norm.forward(x);
        Ok(x.swap_dims(1, 2))
    }

    /// Logits for classification: the normalized hidden state at the final
    /// time step, shape (batch, state_size).
    pub fn forward_classify(&self, input: Tensor<B, 3>) -> Result<Tensor<B, 2>, ShapeError> {
        let seq = self.forward(input)?;
        let [batch, time, hidden] = seq.dims();
        Ok(seq
            .slice([0..batch, time - 1..time, 0..hidden])
            .reshape([batch, hidden]))
    }
}

#[cfg(test)]
mod fold_tests {
    use super::{fold_into_sequence, SequenceShape, ShapeError};

    #[test]
    fn defaults_to_last_dim() {
        let shape = fold_into_sequence(&[32, 28, 28], None).unwrap();
        assert_eq!(
            shape,
            SequenceShape {
                batch: 32,
                time: 28,
                channels: 28
            }
        );
    }

    #[test]
    fn channel_override_folds_rows_and_cols() {
        let shape = fold_into_sequence(&[32, 28, 28], Some(16)).unwrap();
        assert_eq!(
            shape,
            SequenceShape {
                batch: 32,
                time: 49,
                channels: 16
            }
        );
    }

    #[test]
    fn rejects_indivisible_channels() {
        let err = fold_into_sequence(&[32, 28, 28], Some(5)).unwrap_err();
        assert_eq!(
            err,
            ShapeError::Indivisible {
                flat: 784,
                channels: 5
            }
        );
    }

    #[test]
    fn rejects_zero_channels() {
        assert!(fold_into_sequence(&[32, 28, 28], Some(0)).is_err());
    }

    #[test]
    fn needs_batch_and_data_axes() {
        let err = fold_into_sequence(&[32], None).unwrap_err();
        assert_eq!(err, ShapeError::MissingAxes { rank: 1 });
    }
}
