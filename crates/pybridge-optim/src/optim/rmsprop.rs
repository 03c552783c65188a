use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.RMSprop`.
    pub struct RmsPropOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Smoothing constant.
        alpha: f64 => Packing::Plain,
        /// Term added to the denominator.
        eps: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Momentum factor.
        momentum: f64 => Packing::Plain,
        /// Normalize by an estimate of the gradient variance.
        centered: bool => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for RmsPropOptions {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            initial_lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
            weight_decay: 0.0,
            momentum: 0.0,
            centered: false,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.RMSprop`.
    pub struct RmsPropState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Running average of squared gradients.
        square_avg: TensorData => Packing::Plain,
        /// Present when momentum is non-zero.
        momentum_buffer: Option<TensorData> => Packing::Plain,
        /// Present when `centered` is set.
        grad_avg: Option<TensorData> => Packing::Plain,
    }
}

/// RMSprop.
pub type RmsProp = OptimizerState<RmsPropOptions, RmsPropState>;
