use clap::Parser;
use mnist_lstm::dataset::{load_dataset, DatasetConfig, MnistSource, MnistUsage};
use mnist_lstm::training::load_classifier_from_checkpoint;
use mnist_lstm::{
    validate_backend_choice, BackendKind, LstmClassifier, LstmClassifierConfig, TrainBackend,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate an MNIST LSTM checkpoint on the test split"
)]
struct Args {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Checkpoint path to load.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Cache directory for the MNIST files.
    #[arg(long, default_value = "data/mnist")]
    data_dir: PathBuf,
    /// Batch size.
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    /// Cap on test samples.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let source = MnistSource::new(&args.data_dir);
    let dataset = load_dataset(
        MnistUsage::Test,
        &source,
        DatasetConfig {
            batch_size: args.batch_size.max(1),
            drop_last: false,
            limit: args.limit,
            ..Default::default()
        },
    )?;
    if dataset.is_empty() {
        println!("No test samples under {}", source.data_dir.display());
        return Ok(());
    }

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let model = match args.checkpoint {
        Some(ref p) => load_classifier_from_checkpoint(p, &device).unwrap_or_else(|e| {
            println!(
                "Failed to load checkpoint {}; using fresh model ({e})",
                p.display()
            );
            LstmClassifier::<TrainBackend>::new(LstmClassifierConfig::default(), &device)
        }),
        None => {
            println!("No checkpoint provided; using fresh LstmClassifier");
            LstmClassifier::<TrainBackend>::new(LstmClassifierConfig::default(), &device)
        }
    };

    let mut correct = 0usize;
    let mut total = 0usize;
    let mut iter = dataset.iter();
    while let Some(batch) = iter.next_batch::<TrainBackend>(&device) {
        let logits = model.forward_classify(batch.images)?;
        let batch_len = logits.dims()[0];
        let predicted = logits.argmax(1).reshape([batch_len]);
        let hits: f32 = predicted
            .equal(batch.targets)
            .float()
            .sum()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .first()
            .copied()
            .unwrap_or(0.0);
        correct += hits as usize;
        total += batch_len;
    }

    let accuracy = if total > 0 {
        correct as f32 / total as f32
    } else {
        0.0
    };
    println!("Eval complete: accuracy={accuracy:.5} ({correct}/{total})");
    Ok(())
}
