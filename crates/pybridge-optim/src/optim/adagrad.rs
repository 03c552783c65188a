use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.Adagrad`.
    pub struct AdagradOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Learning rate decay.
        lr_decay: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Starting value of the accumulators.
        initial_accumulator_value: f64 => Packing::Plain,
        /// Term added to the denominator.
        eps: f64 => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for AdagradOptions {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            initial_lr: 1e-2,
            lr_decay: 0.0,
            weight_decay: 0.0,
            initial_accumulator_value: 0.0,
            eps: 1e-10,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.Adagrad`.
    pub struct AdagradState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Sum of squared gradients.
        sum: TensorData => Packing::Plain,
    }
}

/// Adagrad.
pub type Adagrad = OptimizerState<AdagradOptions, AdagradState>;
