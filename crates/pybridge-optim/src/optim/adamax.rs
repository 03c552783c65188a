use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.Adamax`.
    pub struct AdamaxOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// `betas[0]`.
        beta1: f64 => Packing::Pair { key: "betas", index: 0 },
        /// `betas[1]`.
        beta2: f64 => Packing::Pair { key: "betas", index: 1 },
        /// Term added to the denominator.
        eps: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for AdamaxOptions {
    fn default() -> Self {
        Self {
            lr: 2e-3,
            initial_lr: 2e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.Adamax`.
    pub struct AdamaxState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// First moment estimate.
        exp_avg: TensorData => Packing::Plain,
        /// Exponentially weighted infinity norm.
        exp_inf: TensorData => Packing::Plain,
    }
}

/// Adamax.
pub type Adamax = OptimizerState<AdamaxOptions, AdamaxState>;
