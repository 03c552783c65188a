use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.ASGD`.
    pub struct AsgdOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Decay term.
        lambd: f64 => Packing::Plain,
        /// Power for the eta update.
        alpha: f64 => Packing::Plain,
        /// Step at which averaging starts.
        t0: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for AsgdOptions {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            initial_lr: 1e-2,
            lambd: 1e-4,
            alpha: 0.75,
            t0: 1e6,
            weight_decay: 0.0,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.ASGD`.
    pub struct AsgdState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Current step size, a 0-d tensor.
        eta: TensorData => Packing::Plain,
        /// Averaging coefficient, a 0-d tensor.
        mu: TensorData => Packing::Plain,
        /// Averaged parameter.
        ax: TensorData => Packing::Plain,
    }
}

/// Averaged stochastic gradient descent.
pub type Asgd = OptimizerState<AsgdOptions, AsgdState>;
