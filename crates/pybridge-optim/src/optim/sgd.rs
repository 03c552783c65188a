use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.SGD`.
    pub struct SgdOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Momentum factor.
        momentum: f64 => Packing::Plain,
        /// Dampening for momentum.
        dampening: f64 => Packing::Plain,
        /// L2 penalty.
        weight_decay: f64 => Packing::Plain,
        /// Use Nesterov momentum.
        nesterov: bool => Packing::Plain,
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for SgdOptions {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            initial_lr: 1e-3,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.SGD`.
    pub struct SgdState {
        /// Momentum buffer, `None` when momentum is disabled.
        momentum_buffer: Option<TensorData> => Packing::Plain,
    }
}

/// Stochastic gradient descent.
pub type Sgd = OptimizerState<SgdOptions, SgdState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamGroup;
    use crate::optim::test_utils::*;
    use pybridge_store::pytorch::PickleValue;

    #[test]
    fn loads_torch_sgd_with_momentum() {
        let group = dict(vec![
            ("lr", 0.01.into()),
            ("momentum", 0.1.into()),
            ("dampening", PickleValue::Int(0)),
            ("weight_decay", PickleValue::Int(0)),
            ("nesterov", false.into()),
            ("maximize", false.into()),
            ("foreach", PickleValue::None),
            ("differentiable", false.into()),
            ("fused", PickleValue::None),
            ("params", params(&[0, 1])),
        ]);
        let state = vec![
            (0, dict(vec![("momentum_buffer", buffer(&[0.5, 0.25]).into())])),
            (1, dict(vec![("momentum_buffer", buffer(&[1.5]).into())])),
        ];

        let mut sgd = Sgd::from_groups(vec![ParamGroup::new(SgdOptions::default(), vec![0, 1])]);
        sgd.load_pickle(&root(state, vec![group])).unwrap();

        let options = &sgd.param_groups[0].options;
        assert_eq!(options.lr, 0.01);
        assert_eq!(options.initial_lr, 0.01);
        assert_eq!(options.momentum, 0.1);
        assert_eq!(options.weight_decay, 0.0);
        assert_eq!(
            sgd.state[1],
            Some(SgdState {
                momentum_buffer: Some(buffer(&[1.5]))
            })
        );
    }

    #[test]
    fn momentum_free_state_round_trips_as_none() {
        let mut sgd = Sgd::from_groups(vec![ParamGroup::new(SgdOptions::default(), vec![0])]);
        sgd.state[0] = Some(SgdState {
            momentum_buffer: None,
        });

        let saved = sgd.to_pickle().unwrap();
        let mut restored =
            Sgd::from_groups(vec![ParamGroup::new(SgdOptions::default(), vec![0])]);
        restored.load_pickle(&saved).unwrap();
        assert_eq!(restored, sgd);
    }
}
