//! Options and state records for the optimizers in `torch.optim`.
//!
//! Field names match the keys PyTorch writes, except where a [`Packing`](crate::Packing) rule
//! splits a tuple into two fields. Option defaults are PyTorch's.

mod adadelta;
mod adagrad;
mod adam;
mod adamax;
mod adamw;
mod asgd;
mod nadam;
mod radam;
mod rmsprop;
mod rprop;
mod sgd;

pub use adadelta::*;
pub use adagrad::*;
pub use adam::*;
pub use adamax::*;
pub use adamw::*;
pub use asgd::*;
pub use nadam::*;
pub use radam::*;
pub use rmsprop::*;
pub use rprop::*;
pub use sgd::*;

#[cfg(test)]
pub(crate) mod test_utils {
    use pybridge_store::TensorData;
    use pybridge_store::pytorch::{DictKey, PickleDict, PickleValue};

    /// A dict with string keys, in the given order.
    pub fn dict(entries: Vec<(&str, PickleValue)>) -> PickleDict {
        let mut dict = PickleDict::new();
        for (key, value) in entries {
            dict.insert(DictKey::from(key), value);
        }
        dict
    }

    /// The `state_dict` root PyTorch writes.
    pub fn root(state: Vec<(i64, PickleDict)>, groups: Vec<PickleDict>) -> PickleValue {
        let mut states = PickleDict::new();
        for (index, entry) in state {
            states.insert(DictKey::Int(index), PickleValue::Dict(entry));
        }
        let groups = groups.into_iter().map(PickleValue::Dict).collect();
        PickleValue::Dict(dict(vec![
            ("state", PickleValue::Dict(states)),
            ("param_groups", PickleValue::List(groups)),
        ]))
    }

    pub fn pair(first: f64, second: f64) -> PickleValue {
        PickleValue::Tuple(vec![first.into(), second.into()])
    }

    pub fn params(indices: &[i64]) -> PickleValue {
        PickleValue::List(indices.iter().map(|i| PickleValue::Int(*i)).collect())
    }

    /// Step counters are float32 0-d tensors in recent PyTorch releases.
    pub fn float_step(step: f32) -> PickleValue {
        TensorData::scalar(step).into()
    }

    pub fn buffer(values: &[f32]) -> TensorData {
        TensorData::new(values.to_vec(), [values.len()])
    }
}
