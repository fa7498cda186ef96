use clap::Parser;
use mnist_lstm::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    run_train(args)?;
    Ok(())
}
