//! Loading a state dict into a module, with strict and non-strict key matching.

use std::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::collections::OrderedMap;
use crate::{ModuleSnapshot, StateDict};

/// Options of a state dict load.
///
/// Deserializes from host configuration; absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyOptions {
    /// Require the loaded keys and the module keys to match exactly.
    pub strict: bool,
    /// Keys ignored on both sides.
    pub skip: Vec<String>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            strict: true,
            skip: Vec::new(),
        }
    }
}

impl ApplyOptions {
    /// Strict options without skipped keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict key matching.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Add keys to ignore.
    pub fn with_skip<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(keys.into_iter().map(Into::into));
        self
    }

    pub(crate) fn skip_set(&self) -> HashSet<&str> {
        self.skip.iter().map(String::as_str).collect()
    }
}

/// Errors raised while applying tensors to a module.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// Strict load with differing key sets.
    #[error(
        "Key mismatch in strict mode, missing from the checkpoint: {missing:?}, \
         unexpected in the checkpoint: {unexpected:?}"
    )]
    KeyMismatch {
        /// Module keys absent from the checkpoint.
        missing: Vec<String>,
        /// Checkpoint keys absent from the module.
        unexpected: Vec<String>,
    },

    /// A tensor does not have the shape of the module tensor.
    #[error("Shape mismatch for `{name}`: module has {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Module shape.
        expected: Vec<usize>,
        /// Checkpoint shape.
        found: Vec<usize>,
    },

    /// The module rejected a tensor.
    #[error("Failed to load `{name}`: {message}")]
    LoadError {
        /// Tensor name.
        name: String,
        /// Reason given by the module.
        message: String,
    },
}

/// Outcome of a state dict load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyResult {
    /// Checkpoint tensors loaded into the module, in checkpoint order.
    pub applied: Vec<String>,
    /// Checkpoint tensors not loaded: skip-listed or unknown to the module (non-strict).
    pub skipped: Vec<String>,
    /// Module tensors the checkpoint did not provide (non-strict).
    pub missing: Vec<String>,
}

impl ApplyResult {
    /// Checkpoint key classification: `true` when loaded, `false` when skipped.
    pub fn loaded_parameters(&self) -> OrderedMap<String, bool> {
        let mut loaded = OrderedMap::new();
        for name in self.applied.iter() {
            loaded.insert(name.clone(), true);
        }
        for name in self.skipped.iter() {
            loaded.insert(name.clone(), false);
        }
        loaded
    }

    /// Merge the result of another partial load into this one.
    pub fn merge(&mut self, other: ApplyResult) {
        self.applied.extend(other.applied);
        self.skipped.extend(other.skipped);
        for name in other.missing {
            if !self.applied.contains(&name) && !self.missing.contains(&name) {
                self.missing.push(name);
            }
        }
        let applied = &self.applied;
        self.missing.retain(|name| !applied.contains(name));
    }

    /// Whether every module tensor was loaded.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Apply result:")?;
        writeln!(f, "  Applied: {}", self.applied.len())?;
        writeln!(f, "  Skipped: {}", self.skipped.len())?;
        writeln!(f, "  Missing: {}", self.missing.len())?;
        if !self.skipped.is_empty() {
            writeln!(f, "  Skipped tensors: {:?}", self.skipped)?;
        }
        if !self.missing.is_empty() {
            writeln!(f, "  Missing tensors: {:?}", self.missing)?;
        }
        Ok(())
    }
}

/// Classification of checkpoint keys against module keys, computed before any tensor is read.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct KeyPlan {
    /// Keys present on both sides, in checkpoint order.
    pub load: Vec<String>,
    /// Checkpoint keys that will not be loaded, in checkpoint order.
    pub skipped: Vec<String>,
    /// Module keys the checkpoint does not provide.
    pub missing: Vec<String>,
}

/// Match checkpoint keys to module keys.
///
/// Skip-listed keys are ignored on both sides. In strict mode the remaining key sets must be
/// equal.
pub(crate) fn plan_keys<'a, 'b>(
    module_keys: impl IntoIterator<Item = &'a str>,
    checkpoint_keys: impl IntoIterator<Item = &'b str>,
    options: &ApplyOptions,
) -> Result<KeyPlan, ApplyError> {
    let skip = options.skip_set();
    let module_keys: Vec<&str> = module_keys
        .into_iter()
        .filter(|name| !skip.contains(*name))
        .collect();
    let known: HashSet<&str> = module_keys.iter().copied().collect();

    let mut plan = KeyPlan::default();
    let mut unexpected = Vec::new();
    let mut provided = HashSet::new();
    for name in checkpoint_keys {
        if skip.contains(name) {
            log::debug!("Skipping `{name}` as requested");
            plan.skipped.push(name.into());
        } else if known.contains(name) {
            provided.insert(name);
            plan.load.push(name.into());
        } else {
            unexpected.push(String::from(name));
            plan.skipped.push(name.into());
        }
    }
    plan.missing = module_keys
        .into_iter()
        .filter(|name| !provided.contains(*name))
        .map(String::from)
        .collect();

    if options.strict && (!plan.missing.is_empty() || !unexpected.is_empty()) {
        return Err(ApplyError::KeyMismatch {
            missing: plan.missing,
            unexpected,
        });
    }
    for name in unexpected.iter() {
        log::debug!("Skipping `{name}`, the module has no such tensor");
    }
    Ok(plan)
}

/// Load `loaded` into `module`.
///
/// Skip-listed keys are ignored on both sides. In strict mode the remaining key sets must be
/// equal. Shapes are checked for every key before the first tensor is loaded, so a failed call
/// leaves the module untouched unless the module itself rejects a tensor.
pub fn apply_state_dict<M: ModuleSnapshot + ?Sized>(
    module: &mut M,
    mut loaded: StateDict,
    options: &ApplyOptions,
) -> Result<ApplyResult, ApplyError> {
    let target = module.state_dict();
    let plan = plan_keys(target.names(), loaded.names(), options)?;

    let mut tensors = Vec::with_capacity(plan.load.len());
    for name in plan.load.iter() {
        let (Some(current), Some(tensor)) = (target.get(name), loaded.remove(name)) else {
            continue;
        };
        if current.shape() != tensor.shape() {
            return Err(ApplyError::ShapeMismatch {
                name: name.clone(),
                expected: current.shape().to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        tensors.push((name, tensor));
    }

    let mut result = ApplyResult::default();
    for (name, tensor) in tensors {
        module.load_tensor(name, tensor)?;
        result.applied.push(name.clone());
    }
    result.skipped = plan.skipped;
    result.missing = plan.missing;

    if !result.missing.is_empty() {
        log::debug!("{} module tensors were not loaded", result.missing.len());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;

    fn module() -> StateDict {
        [
            ("lin.weight", TensorData::zeros(crate::tensor::DType::F32, [2, 3])),
            ("lin.bias", TensorData::zeros(crate::tensor::DType::F32, [2])),
        ]
        .into_iter()
        .collect()
    }

    fn checkpoint() -> StateDict {
        [
            ("lin.weight", TensorData::full(1.0f32, [2, 3])),
            ("lin.bias", TensorData::full(2.0f32, [2])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn strict_load_applies_everything() {
        let mut target = module();
        let result = apply_state_dict(&mut target, checkpoint(), &ApplyOptions::default()).unwrap();

        assert_eq!(result.applied, vec!["lin.weight", "lin.bias"]);
        assert!(result.is_complete());
        assert_eq!(target.get("lin.bias").unwrap().to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn non_strict_load_reports_extra_keys_as_skipped() {
        let mut loaded = checkpoint();
        loaded.insert("bias2", TensorData::full(3.0f32, [2]));
        let mut target = module();

        let options = ApplyOptions::new().with_strict(false);
        let result = apply_state_dict(&mut target, loaded, &options).unwrap();

        let classification = result.loaded_parameters();
        assert_eq!(classification.get("bias2"), Some(&false));
        assert_eq!(classification.get("lin.weight"), Some(&true));
        assert!(!target.contains("bias2"));
    }

    #[test]
    fn strict_load_rejects_extra_keys() {
        let mut loaded = checkpoint();
        loaded.insert("bias2", TensorData::full(3.0f32, [2]));
        let mut target = module();

        let err = apply_state_dict(&mut target, loaded, &ApplyOptions::default()).unwrap_err();
        assert_eq!(
            err,
            ApplyError::KeyMismatch {
                missing: vec![],
                unexpected: vec!["bias2".into()]
            }
        );
        assert_eq!(target, module());
    }

    #[test]
    fn skip_list_applies_to_both_sides() {
        let mut loaded = checkpoint();
        loaded.remove("lin.bias");
        loaded.insert("extra", TensorData::full(3.0f32, [1]));
        let mut target = module();

        let options = ApplyOptions::new().with_skip(["lin.bias", "extra"]);
        let result = apply_state_dict(&mut target, loaded, &options).unwrap();

        assert_eq!(result.applied, vec!["lin.weight"]);
        assert_eq!(result.skipped, vec!["extra"]);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let mut loaded = checkpoint();
        loaded.insert("lin.bias", TensorData::full(2.0f32, [3]));
        let mut target = module();

        let options = ApplyOptions::new().with_strict(false);
        let err = apply_state_dict(&mut target, loaded, &options).unwrap_err();
        assert!(matches!(err, ApplyError::ShapeMismatch { ref name, .. } if name == "lin.bias"));
        assert_eq!(target, module());
    }

    #[test]
    fn plan_keeps_checkpoint_order() {
        let options = ApplyOptions::new().with_strict(false).with_skip(["b"]);
        let plan = plan_keys(["a", "c", "d"], ["c", "b", "x", "a"], &options).unwrap();

        assert_eq!(plan.load, vec!["c", "a"]);
        assert_eq!(plan.skipped, vec!["b", "x"]);
        assert_eq!(plan.missing, vec!["d"]);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ApplyOptions = serde_json::from_str(r#"{"skip": ["a"]}"#).unwrap();
        assert!(options.strict);
        assert_eq!(options.skip, vec!["a"]);
    }
}
