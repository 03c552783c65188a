use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.NAdam`.
    pub struct NAdamOptions {
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
        /// Momentum decay.
        momentum_decay: f64 => Packing::Plain,
        /// Apply weight decay as in AdamW.
        decoupled_weight_decay: bool => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for NAdamOptions {
    fn default() -> Self {
        Self {
            lr: 2e-3,
            initial_lr: 2e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            momentum_decay: 4e-3,
            decoupled_weight_decay: false,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.NAdam`.
    pub struct NAdamState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Product of the momentum coefficients, a 0-d tensor.
        mu_product: TensorData => Packing::Plain,
        /// First moment estimate.
        exp_avg: TensorData => Packing::Plain,
        /// Second moment estimate.
        exp_avg_sq: TensorData => Packing::Plain,
    }
}

/// Adam with Nesterov momentum.
pub type NAdam = OptimizerState<NAdamOptions, NAdamState>;
