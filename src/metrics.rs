//! Evaluators accumulated over validation passes.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// A metric fed batch-by-batch during evaluation and read out once per epoch.
pub trait Evaluator<B: Backend> {
    fn name(&self) -> &str;
    fn update(&mut self, logits: &Tensor<B, 2>, targets: &Tensor<B, 1, Int>);
    fn value(&self) -> f32;
    fn reset(&mut self);
}

/// Fraction of samples whose argmax logit matches the target label.
#[derive(Debug, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Evaluator<B> for Accuracy {
    fn name(&self) -> &str {
        "Accuracy"
    }

    fn update(&mut self, logits: &Tensor<B, 2>, targets: &Tensor<B, 1, Int>) {
        let batch = logits.dims()[0];
        let predicted = logits.clone().argmax(1).reshape([batch]);
        let hits: f32 = predicted
            .equal(targets.clone())
            .float()
            .sum()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .first()
            .copied()
            .unwrap_or(0.0);
        self.correct += hits as usize;
        self.total += batch;
    }

    fn value(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}
