use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.Adadelta`.
    pub struct AdadeltaOptions {
        /// Coefficient scaling the delta.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Running average coefficient.
        rho: f64 => Packing::Plain,
        /// Term added to the denominator.
        eps: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for AdadeltaOptions {
    fn default() -> Self {
        Self {
            lr: 1.0,
            initial_lr: 1.0,
            rho: 0.9,
            eps: 1e-6,
            weight_decay: 0.0,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.Adadelta`.
    pub struct AdadeltaState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Running average of squared gradients.
        square_avg: TensorData => Packing::Plain,
        /// Running average of squared updates.
        acc_delta: TensorData => Packing::Plain,
    }
}

/// Adadelta.
pub type Adadelta = OptimizerState<AdadeltaOptions, AdadeltaState>;
