use crate::optim::AdamState;
use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.AdamW`.
    pub struct AdamWOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Decay rate of the first moment, `betas[0]`.
        beta1: f64 => Packing::Pair { key: "betas", index: 0 },
        /// Decay rate of the second moment, `betas[1]`.
        beta2: f64 => Packing::Pair { key: "betas", index: 1 },
        /// Term added to the denominator.
        eps: f64 => Packing::Plain,
        /// Decoupled weight decay.
        weight_decay: f64 => Packing::Plain,
        /// Use the AMSGrad variant.
        amsgrad: bool => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for AdamWOptions {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            initial_lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-2,
            amsgrad: false,
            maximize: false,
        }
    }
}

/// AdamW keeps the same per-parameter state as Adam.
pub type AdamWState = AdamState;

/// Adam with decoupled weight decay.
pub type AdamW = OptimizerState<AdamWOptions, AdamWState>;
