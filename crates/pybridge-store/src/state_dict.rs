use crate::collections::OrderedMap;
use crate::pytorch::{DictKey, PickleDict, PickleValue};
use crate::tensor::TensorData;

/// Ordered mapping of parameter and buffer names to tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: OrderedMap<String, TensorData>,
}

impl StateDict {
    /// Create an empty state dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, replacing and returning any previous tensor of that name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: TensorData) -> Option<TensorData> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Tensor by name.
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    /// Mutable tensor by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TensorData> {
        self.tensors.get_mut(name)
    }

    /// Remove a tensor, keeping the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<TensorData> {
        self.tensors.remove(name)
    }

    /// Whether a tensor of that name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether there are no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Keep only the tensors whose name matches.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tensors.retain(|name, _| keep(name));
    }

    /// The `collections.OrderedDict` value `torch.save` writes for a state dict.
    pub fn to_pickle(&self) -> PickleValue {
        let dict: PickleDict = self
            .tensors
            .iter()
            .map(|(name, tensor)| (DictKey::String(name.clone()), tensor.clone().into()))
            .collect();
        PickleValue::OrderedDict(dict)
    }
}

impl<S: Into<String>> FromIterator<(S, TensorData)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (S, TensorData)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (name, tensor) in iter {
            dict.insert(name, tensor);
        }
        dict
    }
}

impl IntoIterator for StateDict {
    type Item = (String, TensorData);
    type IntoIter = std::vec::IntoIter<(String, TensorData)>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl Extend<(String, TensorData)> for StateDict {
    fn extend<I: IntoIterator<Item = (String, TensorData)>>(&mut self, iter: I) {
        for (name, tensor) in iter {
            self.insert(name, tensor);
        }
    }
}
