use std::fmt;
use std::rc::Rc;

use crate::collections::OrderedMap;
use crate::pytorch::rebuild::DeferredTensor;
use crate::pytorch::storage::StorageRecord;
use crate::tensor::TensorData;
use crate::StoreError;

/// Key of a decoded dictionary. Checkpoints only key dictionaries by strings and integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictKey {
    /// Integer key, e.g. a parameter index in optimizer state.
    Int(i64),
    /// String key, e.g. a parameter name.
    String(String),
}

impl From<&str> for DictKey {
    fn from(value: &str) -> Self {
        DictKey::String(value.into())
    }
}

impl From<String> for DictKey {
    fn from(value: String) -> Self {
        DictKey::String(value)
    }
}

impl From<i64> for DictKey {
    fn from(value: i64) -> Self {
        DictKey::Int(value)
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DictKey::Int(v) => write!(f, "{v}"),
            DictKey::String(v) => f.write_str(v),
        }
    }
}

/// Insertion-ordered dictionary of decoded values.
pub type PickleDict = OrderedMap<DictKey, PickleValue>;

/// A tensor inside a decoded value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorRef {
    /// Bytes are in memory.
    Loaded(TensorData),
    /// Bytes are still in the archive and can be read once.
    Deferred(DeferredTensor),
}

impl TensorRef {
    /// Return the tensor data, reading it from the archive if it is deferred.
    pub fn load(&self) -> Result<TensorData, StoreError> {
        match self {
            TensorRef::Loaded(data) => Ok(data.clone()),
            TensorRef::Deferred(deferred) => deferred.load(),
        }
    }
}

impl From<TensorData> for TensorRef {
    fn from(value: TensorData) -> Self {
        TensorRef::Loaded(value)
    }
}

/// Generic value tree produced by the pickle decoder and consumed by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    /// `None`.
    None,
    /// `bool`.
    Bool(bool),
    /// `int` that fits in 64 bits.
    Int(i64),
    /// `float`.
    Float(f64),
    /// `bytes`.
    Bytes(Vec<u8>),
    /// `str`.
    String(String),
    /// `tuple`.
    Tuple(Vec<PickleValue>),
    /// `list`.
    List(Vec<PickleValue>),
    /// `dict`.
    Dict(PickleDict),
    /// `collections.OrderedDict`.
    OrderedDict(PickleDict),
    /// Reference to a global such as `torch.FloatStorage`.
    Global {
        /// Module path.
        module: String,
        /// Qualified name inside the module.
        name: String,
    },
    /// Resolved persistent storage reference.
    Storage(Rc<StorageRecord>),
    /// Rebuilt tensor.
    Tensor(TensorRef),
}

impl PickleValue {
    /// Short Python-like name of the value type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PickleValue::None => "None",
            PickleValue::Bool(_) => "bool",
            PickleValue::Int(_) => "int",
            PickleValue::Float(_) => "float",
            PickleValue::Bytes(_) => "bytes",
            PickleValue::String(_) => "str",
            PickleValue::Tuple(_) => "tuple",
            PickleValue::List(_) => "list",
            PickleValue::Dict(_) => "dict",
            PickleValue::OrderedDict(_) => "OrderedDict",
            PickleValue::Global { .. } => "global",
            PickleValue::Storage(_) => "storage",
            PickleValue::Tensor(_) => "tensor",
        }
    }

    /// The string, if the value is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PickleValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if the value is one. Booleans are not integers here.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PickleValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The float, accepting integers as Python does.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PickleValue::Float(v) => Some(*v),
            PickleValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The items of a tuple or list.
    pub fn as_sequence(&self) -> Option<&[PickleValue]> {
        match self {
            PickleValue::Tuple(items) | PickleValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// The entries of a dict or ordered dict.
    pub fn as_dict(&self) -> Option<&PickleDict> {
        match self {
            PickleValue::Dict(dict) | PickleValue::OrderedDict(dict) => Some(dict),
            _ => None,
        }
    }

    /// The tensor, if the value is one.
    pub fn as_tensor(&self) -> Option<&TensorRef> {
        match self {
            PickleValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Unwrap a sequence of non-negative integers, e.g. a shape or a stride.
    pub(crate) fn to_usize_vec(&self, what: &str) -> Result<Vec<usize>, StoreError> {
        let items = self.as_sequence().ok_or_else(|| {
            StoreError::Format(format!(
                "expected {what} to be a tuple, got {}",
                self.type_name()
            ))
        })?;
        items
            .iter()
            .map(|item| match item.as_int() {
                Some(v) if v >= 0 => Ok(v as usize),
                _ => Err(StoreError::Format(format!(
                    "expected {what} to contain non-negative integers, got {item:?}"
                ))),
            })
            .collect()
    }
}

impl From<TensorData> for PickleValue {
    fn from(value: TensorData) -> Self {
        PickleValue::Tensor(TensorRef::Loaded(value))
    }
}

impl From<&str> for PickleValue {
    fn from(value: &str) -> Self {
        PickleValue::String(value.into())
    }
}

impl From<i64> for PickleValue {
    fn from(value: i64) -> Self {
        PickleValue::Int(value)
    }
}

impl From<f64> for PickleValue {
    fn from(value: f64) -> Self {
        PickleValue::Float(value)
    }
}

impl From<bool> for PickleValue {
    fn from(value: bool) -> Self {
        PickleValue::Bool(value)
    }
}
