//! Command-line surface shared by the train and eval binaries.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

/// Command line configuration for training.
#[derive(Parser, Debug, Clone)]
#[command(name = "train", about = "Train an LSTM digit classifier on MNIST")]
pub struct TrainArgs {
    /// Number of epochs.
    #[arg(long, default_value_t = 2)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    /// Directory for checkpoints, model properties, and the epoch trace.
    #[arg(long, default_value = "output/mnist-lstm")]
    pub output_dir: PathBuf,
    /// Maximum GPUs to use (0 trains on CPU).
    #[arg(long, default_value_t = 0)]
    pub max_gpus: usize,
    /// Cap on samples per split (applies to train and test alike).
    #[arg(long)]
    pub limit: Option<usize>,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Backend RNG seed for reproducible weight init.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Cache directory for the MNIST files.
    #[arg(long, default_value = "data/mnist")]
    pub data_dir: PathBuf,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            println!("note: built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
