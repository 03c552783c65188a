use pybridge_store::TensorData;

use crate::{OptimizerState, Packing};

crate::optimizer_record! {
    /// Options of `torch.optim.Rprop`.
    ///
    /// `etaminus`/`etaplus` are stored as the `etas` pair and `min_step`/`max_step` as the
    /// `step_sizes` pair.
    pub struct RpropOptions {
        /// Learning rate.
        lr: f64 => Packing::LearningRate,
        /// Learning rate a scheduler started from.
        initial_lr: f64 => Packing::InitialLearningRate,
        /// Multiplicative decrease factor.
        etaminus: f64 => Packing::Pair { key: "etas", index: 0 },
        /// Multiplicative increase factor.
        etaplus: f64 => Packing::Pair { key: "etas", index: 1 },
        /// Smallest allowed step size.
        min_step: f64 => Packing::Pair { key: "step_sizes", index: 0 },
        /// Largest allowed step size.
        max_step: f64 => Packing::Pair { key: "step_sizes", index: 1 },
        /// Maximize the objective instead of minimizing it.
        maximize: bool => Packing::Plain,
    }
}

impl Default for RpropOptions {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            initial_lr: 1e-2,
            etaminus: 0.5,
            etaplus: 1.2,
            min_step: 1e-6,
            max_step: 50.0,
            maximize: false,
        }
    }
}

crate::optimizer_record! {
    /// Per-parameter state of `torch.optim.Rprop`.
    pub struct RpropState {
        /// Steps taken.
        step: i64 => Packing::Step,
        /// Previous gradient.
        prev: TensorData => Packing::Plain,
        /// Per-element step sizes.
        step_size: TensorData => Packing::Plain,
    }
}

/// Resilient backpropagation.
pub type Rprop = OptimizerState<RpropOptions, RpropState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamGroup;
    use crate::optim::test_utils::*;

    #[test]
    fn etas_unpack_per_group() {
        let first = dict(vec![
            ("lr", 0.001.into()),
            ("etas", pair(0.35, 1.5)),
            ("step_sizes", pair(1e-5, 5.0)),
            ("maximize", false.into()),
            ("params", params(&[0])),
        ]);
        let second = dict(vec![
            ("lr", 0.01.into()),
            ("etas", pair(0.45, 1.5)),
            ("step_sizes", pair(1e-5, 5.0)),
            ("maximize", true.into()),
            ("params", params(&[1])),
        ]);
        let state = dict(vec![
            ("step", float_step(1.0)),
            ("prev", buffer(&[0.0]).into()),
            ("step_size", buffer(&[0.01]).into()),
        ]);

        let mut rprop = Rprop::from_groups(vec![
            ParamGroup::new(RpropOptions::default(), vec![0]),
            ParamGroup::new(RpropOptions::default(), vec![1]),
        ]);
        rprop
            .load_pickle(&root(vec![(1, state)], vec![first, second]))
            .unwrap();

        assert_eq!(rprop.param_groups[0].options.etaminus, 0.35);
        assert_eq!(rprop.param_groups[1].options.etaminus, 0.45);
        assert!(rprop.param_groups[1].options.maximize);
        assert_eq!(rprop.state[0], None);
        assert_eq!(rprop.state[1].as_ref().map(|state| state.step), Some(1));
    }

    #[test]
    fn malformed_pair_is_rejected() {
        let group = dict(vec![("etas", 0.5.into()), ("params", params(&[0]))]);
        let mut rprop =
            Rprop::from_groups(vec![ParamGroup::new(RpropOptions::default(), vec![0])]);

        assert!(matches!(
            rprop.load_pickle(&root(vec![], vec![group])),
            Err(crate::OptimStateError::InvalidStructure(_))
        ));
    }
}
