use std::collections::{BTreeMap, BTreeSet};

use derive_new::new;
use pybridge_store::TensorData;
use pybridge_store::pytorch::{DictKey, PickleDict, PickleValue};

use crate::record::{FieldSpec, FieldType, FieldValue, OptimizerRecord, Packing};
use crate::OptimStateError;

/// A parameter group: one options object shared by a list of global parameter indices.
#[derive(Debug, Clone, PartialEq, new)]
pub struct ParamGroup<O> {
    /// Options applied to every parameter of the group.
    pub options: O,
    /// Global indices of the group's parameters.
    pub params: Vec<usize>,
}

/// Live optimizer state.
///
/// `state[i]` belongs to global parameter index `i`; `None` means the parameter was never
/// stepped.
#[derive(Debug, Clone, PartialEq, new)]
pub struct OptimizerState<O, S> {
    /// Parameter groups.
    pub param_groups: Vec<ParamGroup<O>>,
    /// Per-parameter state, indexed by global parameter index.
    pub state: Vec<Option<S>>,
}

impl<O: OptimizerRecord, S: OptimizerRecord> OptimizerState<O, S> {
    /// Create an optimizer whose parameters have never been stepped.
    pub fn from_groups(param_groups: Vec<ParamGroup<O>>) -> Self {
        let num_params = param_groups
            .iter()
            .flat_map(|group| group.params.iter())
            .map(|index| index + 1)
            .max()
            .unwrap_or(0);
        Self {
            param_groups,
            state: (0..num_params).map(|_| None).collect(),
        }
    }

    /// Convert to the generic `state_dict` structure.
    pub fn to_pickle(&self) -> Result<PickleValue, OptimStateError> {
        save_optimizer_state(&self.param_groups, &self.state)
    }

    /// Load from the generic `state_dict` structure.
    pub fn load_pickle(&mut self, value: &PickleValue) -> Result<(), OptimStateError> {
        load_optimizer_state(value, &mut self.param_groups, &mut self.state)
    }
}

fn entry<'a>(dict: &'a PickleDict, key: &str) -> Option<&'a PickleValue> {
    dict.get(&DictKey::from(key))
}

fn invalid(message: impl Into<String>) -> OptimStateError {
    OptimStateError::InvalidStructure(message.into())
}

/// Produce `{"state": {...}, "param_groups": [...]}` from typed groups and states.
///
/// Never-stepped parameters are left out of `state`, as PyTorch does.
pub fn save_optimizer_state<O, S>(
    groups: &[ParamGroup<O>],
    states: &[Option<S>],
) -> Result<PickleValue, OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
{
    let mut seen = BTreeSet::new();
    for index in groups.iter().flat_map(|group| group.params.iter()) {
        if *index >= states.len() {
            return Err(invalid(format!(
                "parameter index {index} has no state slot, the optimizer holds {} parameters",
                states.len()
            )));
        }
        if !seen.insert(*index) {
            return Err(invalid(format!(
                "parameter index {index} belongs to more than one group"
            )));
        }
    }

    let mut state = PickleDict::new();
    for (index, record) in states.iter().enumerate() {
        if let Some(record) = record {
            state.insert(
                DictKey::Int(index as i64),
                PickleValue::Dict(pack_record(record)),
            );
        }
    }

    let param_groups = groups
        .iter()
        .map(|group| {
            let mut packed = pack_record(&group.options);
            let params = group
                .params
                .iter()
                .map(|index| PickleValue::Int(*index as i64))
                .collect();
            packed.insert("params".into(), PickleValue::List(params));
            PickleValue::Dict(packed)
        })
        .collect();

    let mut root = PickleDict::new();
    root.insert("state".into(), PickleValue::Dict(state));
    root.insert("param_groups".into(), PickleValue::List(param_groups));
    Ok(PickleValue::Dict(root))
}

fn pack_record<R: OptimizerRecord>(record: &R) -> PickleDict {
    let mut dict = PickleDict::new();
    for spec in R::FIELDS {
        let Some(value) = record.field(spec.name) else {
            continue;
        };
        match spec.packing {
            Packing::Plain => {
                dict.insert(spec.name.into(), value.into_pickle());
            }
            Packing::LearningRate => {
                dict.insert("lr".into(), value.into_pickle());
            }
            Packing::InitialLearningRate => {}
            Packing::Step => {
                let step = match value {
                    FieldValue::Int(step) => PickleValue::from(TensorData::scalar(step)),
                    other => other.into_pickle(),
                };
                dict.insert(spec.name.into(), step);
            }
            Packing::Pair { key, index } => {
                let key = DictKey::from(key);
                if !dict.contains_key(&key) {
                    dict.insert(
                        key.clone(),
                        PickleValue::Tuple(std::vec![PickleValue::None, PickleValue::None]),
                    );
                }
                if let Some(PickleValue::Tuple(items)) = dict.get_mut(&key) {
                    if let Some(slot) = items.get_mut(index) {
                        *slot = value.into_pickle();
                    }
                }
            }
        }
    }
    dict
}

/// Load the generic `state_dict` structure into typed groups and states.
///
/// Groups are matched by position and parameters by their position inside each group; the
/// counts must agree. Parameters whose checkpoint state is absent or empty are reset to never
/// stepped. Fields the checkpoint does not have keep their live value and unknown checkpoint
/// keys are ignored. Nothing is modified unless the whole structure loads.
pub fn load_optimizer_state<O, S>(
    value: &PickleValue,
    groups: &mut [ParamGroup<O>],
    states: &mut [Option<S>],
) -> Result<(), OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
{
    let root = value.as_dict().ok_or_else(|| {
        invalid(format!(
            "expected the optimizer state to be a dict, got {}",
            value.type_name()
        ))
    })?;
    let loaded_groups = entry(root, "param_groups")
        .and_then(PickleValue::as_sequence)
        .ok_or_else(|| invalid("`param_groups` is missing or is not a list"))?;

    if loaded_groups.len() != groups.len() {
        return Err(OptimStateError::GroupCountMismatch {
            expected: groups.len(),
            found: loaded_groups.len(),
        });
    }

    let mut options = Vec::with_capacity(groups.len());
    let mut source_keys = BTreeMap::new();
    for (group_index, (live, loaded)) in groups.iter().zip(loaded_groups).enumerate() {
        let loaded = loaded
            .as_dict()
            .ok_or_else(|| invalid(format!("parameter group {group_index} is not a dict")))?;
        let params = entry(loaded, "params")
            .and_then(PickleValue::as_sequence)
            .ok_or_else(|| {
                invalid(format!(
                    "parameter group {group_index} has no `params` list"
                ))
            })?;

        if params.len() != live.params.len() {
            return Err(OptimStateError::ParamCountMismatch {
                group: group_index,
                expected: live.params.len(),
                found: params.len(),
            });
        }

        for (live_index, key) in live.params.iter().zip(params) {
            let key = match key {
                PickleValue::Int(v) => DictKey::Int(*v),
                PickleValue::String(s) => DictKey::String(s.clone()),
                other => {
                    return Err(invalid(format!(
                        "parameter group {group_index} lists a {} as a parameter",
                        other.type_name()
                    )));
                }
            };
            source_keys.insert(*live_index, key);
        }

        options.push(update_record(&live.options, loaded)?);
    }

    let loaded_state = match entry(root, "state") {
        Some(state) => Some(
            state
                .as_dict()
                .ok_or_else(|| invalid("`state` is not a dict"))?,
        ),
        None => None,
    };

    let mut resolved = Vec::with_capacity(states.len());
    for (index, live) in states.iter().enumerate() {
        let Some(key) = source_keys.get(&index) else {
            log::debug!("Parameter {index} is in no group, keeping its state");
            resolved.push(live.clone());
            continue;
        };

        let source = match loaded_state.and_then(|state| state.get(key)) {
            Some(source) => source.as_dict().ok_or_else(|| {
                invalid(format!("state of parameter {key} is a {}", source.type_name()))
            })?,
            None => {
                resolved.push(None);
                continue;
            }
        };

        let record = if source.is_empty() {
            None
        } else {
            match live {
                Some(live) => Some(update_record(live, source)?),
                None => Some(create_record(source)?),
            }
        };
        resolved.push(record);
    }

    for (group, options) in groups.iter_mut().zip(options) {
        group.options = options;
    }
    for (slot, record) in states.iter_mut().zip(resolved) {
        *slot = record;
    }
    Ok(())
}

/// Unpack every field of `R` that `dict` holds.
fn unpack_fields<R: OptimizerRecord>(
    dict: &PickleDict,
) -> Result<BTreeMap<&'static str, FieldValue>, OptimStateError> {
    let mut fields = BTreeMap::new();
    for spec in R::FIELDS {
        match packed_value(dict, spec)? {
            Some(value) => {
                fields.insert(spec.name, field_value(spec, value)?);
            }
            None => log::debug!(
                "Field `{}` is not in the checkpoint, keeping the live value",
                spec.name
            ),
        }
    }
    Ok(fields)
}

fn update_record<R: OptimizerRecord>(live: &R, dict: &PickleDict) -> Result<R, OptimStateError> {
    let fields = unpack_fields::<R>(dict)?;
    let mut record = live.clone();
    for (name, value) in fields {
        record.set_field(name, value)?;
    }
    Ok(record)
}

fn create_record<R: OptimizerRecord>(dict: &PickleDict) -> Result<R, OptimStateError> {
    let mut fields = unpack_fields::<R>(dict)?;
    R::from_fields(|name| fields.remove(name))
}

/// Locate the stored value of a field, undoing its packing rule.
fn packed_value<'a>(
    dict: &'a PickleDict,
    spec: &FieldSpec,
) -> Result<Option<&'a PickleValue>, OptimStateError> {
    let value = match spec.packing {
        Packing::Plain | Packing::Step => entry(dict, spec.name),
        Packing::LearningRate => entry(dict, "lr"),
        Packing::InitialLearningRate => entry(dict, "initial_lr").or_else(|| entry(dict, "lr")),
        Packing::Pair { key, index } => match entry(dict, key) {
            Some(pair) => {
                let items = pair
                    .as_sequence()
                    .filter(|items| items.len() == 2)
                    .ok_or_else(|| {
                        invalid(format!(
                            "`{key}` should be a pair, got {}",
                            pair.type_name()
                        ))
                    })?;
                items.get(index)
            }
            None => None,
        },
    };
    Ok(value)
}

/// Convert a stored value to the field's type, unwrapping 0-d tensors into scalars.
fn field_value(spec: &FieldSpec, value: &PickleValue) -> Result<FieldValue, OptimStateError> {
    let mismatch = |found: String| OptimStateError::TypeMismatch {
        field: spec.name.to_string(),
        expected: spec.ty,
        found,
    };

    let value = match value {
        PickleValue::None => FieldValue::None,
        PickleValue::Bool(v) => FieldValue::Bool(*v),
        PickleValue::Int(v) => FieldValue::Int(*v),
        PickleValue::Float(v) => FieldValue::Float(*v),
        PickleValue::Tensor(tensor) => {
            let tensor = tensor.load()?;
            match spec.ty {
                FieldType::Tensor | FieldType::OptionalTensor => FieldValue::Tensor(tensor),
                FieldType::Float | FieldType::Int | FieldType::Bool => {
                    unwrap_scalar(spec, &tensor)?
                }
            }
        }
        other => return Err(mismatch(other.type_name().to_string())),
    };
    Ok(value)
}

fn unwrap_scalar(spec: &FieldSpec, tensor: &TensorData) -> Result<FieldValue, OptimStateError> {
    let scalar = tensor
        .to_scalar()
        .map_err(|_| OptimStateError::TypeMismatch {
            field: spec.name.to_string(),
            expected: spec.ty,
            found: format!("a tensor of shape {:?}", tensor.shape()),
        })?;
    let unsupported = || OptimStateError::UnsupportedScalar {
        field: spec.name.to_string(),
        dtype: scalar.dtype(),
    };

    let value = match spec.ty {
        FieldType::Int => FieldValue::Int(scalar.as_i64().ok_or_else(unsupported)?),
        FieldType::Bool => FieldValue::Bool(scalar.as_bool().ok_or_else(unsupported)?),
        _ => FieldValue::Float(scalar.as_f64().ok_or_else(unsupported)?),
    };
    Ok(value)
}
