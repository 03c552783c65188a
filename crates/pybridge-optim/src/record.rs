use std::fmt;

use pybridge_store::TensorData;
use pybridge_store::pytorch::PickleValue;

use crate::OptimStateError;

/// How a typed field is laid out in the generic `state_dict` structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Stored under the field name.
    Plain,
    /// The learning rate, stored under `lr`.
    LearningRate,
    /// The learning rate a scheduler started from. Not written; read from `initial_lr`, or from
    /// `lr` when the checkpoint has no scheduler entry.
    InitialLearningRate,
    /// One half of a 2-tuple stored under `key`, e.g. `beta1` is `betas[0]`.
    Pair {
        /// Key of the tuple.
        key: &'static str,
        /// Position inside the tuple, 0 or 1.
        index: usize,
    },
    /// A step counter, written as a 0-d `int64` tensor.
    Step,
}

/// Type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// `f64`.
    Float,
    /// `i64`.
    Int,
    /// `bool`.
    Bool,
    /// A tensor that is always present.
    Tensor,
    /// A tensor that may be `None`.
    OptionalTensor,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Float => "a float",
            FieldType::Int => "an int",
            FieldType::Bool => "a bool",
            FieldType::Tensor => "a tensor",
            FieldType::OptionalTensor => "a tensor or None",
        };
        f.write_str(name)
    }
}

/// One entry of a record's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Rust field name.
    pub name: &'static str,
    /// Layout in the generic structure.
    pub packing: Packing,
    /// Declared type.
    pub ty: FieldType,
}

/// A field value in transit between a record and the generic structure.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Float.
    Float(f64),
    /// Integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Tensor.
    Tensor(TensorData),
    /// An absent optional tensor.
    None,
}

impl FieldValue {
    pub(crate) fn describe(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("float {v}"),
            FieldValue::Int(v) => format!("int {v}"),
            FieldValue::Bool(v) => format!("bool {v}"),
            FieldValue::Tensor(t) => format!("{} tensor of shape {:?}", t.dtype(), t.shape()),
            FieldValue::None => "None".to_string(),
        }
    }

    pub(crate) fn into_pickle(self) -> PickleValue {
        match self {
            FieldValue::Float(v) => PickleValue::Float(v),
            FieldValue::Int(v) => PickleValue::Int(v),
            FieldValue::Bool(v) => PickleValue::Bool(v),
            FieldValue::Tensor(t) => PickleValue::from(t),
            FieldValue::None => PickleValue::None,
        }
    }
}

/// Rust types usable as record fields.
pub trait Field: Sized {
    /// Type reported in the field table.
    const TYPE: FieldType;

    /// Convert the field for packing.
    fn to_value(&self) -> FieldValue;

    /// Convert an unpacked value back, failing on a type mismatch.
    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError>;

    /// Value used when the checkpoint has no entry for a field of a record being created.
    fn absent() -> Option<Self> {
        None
    }
}

fn mismatch(field: &str, expected: FieldType, value: &FieldValue) -> OptimStateError {
    OptimStateError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: value.describe(),
    }
}

impl Field for f64 {
    const TYPE: FieldType = FieldType::Float;

    fn to_value(&self) -> FieldValue {
        FieldValue::Float(*self)
    }

    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError> {
        match value {
            FieldValue::Float(v) => Ok(v),
            FieldValue::Int(v) => Ok(v as f64),
            other => Err(mismatch(field, Self::TYPE, &other)),
        }
    }
}

impl Field for i64 {
    const TYPE: FieldType = FieldType::Int;

    fn to_value(&self) -> FieldValue {
        FieldValue::Int(*self)
    }

    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError> {
        match value {
            FieldValue::Int(v) => Ok(v),
            FieldValue::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            other => Err(mismatch(field, Self::TYPE, &other)),
        }
    }
}

impl Field for bool {
    const TYPE: FieldType = FieldType::Bool;

    fn to_value(&self) -> FieldValue {
        FieldValue::Bool(*self)
    }

    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError> {
        match value {
            FieldValue::Bool(v) => Ok(v),
            other => Err(mismatch(field, Self::TYPE, &other)),
        }
    }
}

impl Field for TensorData {
    const TYPE: FieldType = FieldType::Tensor;

    fn to_value(&self) -> FieldValue {
        FieldValue::Tensor(self.clone())
    }

    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError> {
        match value {
            FieldValue::Tensor(t) => Ok(t),
            other => Err(mismatch(field, Self::TYPE, &other)),
        }
    }
}

impl Field for Option<TensorData> {
    const TYPE: FieldType = FieldType::OptionalTensor;

    fn to_value(&self) -> FieldValue {
        match self {
            Some(t) => FieldValue::Tensor(t.clone()),
            None => FieldValue::None,
        }
    }

    fn from_value(field: &str, value: FieldValue) -> Result<Self, OptimStateError> {
        match value {
            FieldValue::Tensor(t) => Ok(Some(t)),
            FieldValue::None => Ok(None),
            other => Err(mismatch(field, Self::TYPE, &other)),
        }
    }

    fn absent() -> Option<Self> {
        Some(None)
    }
}

/// A typed options or state object with a closed field table.
///
/// Implemented with [`optimizer_record!`](crate::optimizer_record).
pub trait OptimizerRecord: Clone + fmt::Debug + Sized {
    /// Every field in declaration order, with its packing rule.
    const FIELDS: &'static [FieldSpec];

    /// Read a field by name.
    fn field(&self, name: &str) -> Option<FieldValue>;

    /// Overwrite a field by name.
    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), OptimStateError>;

    /// Build a record from unpacked values; `lookup` returns `None` for fields the checkpoint
    /// does not have.
    fn from_fields<F>(lookup: F) -> Result<Self, OptimStateError>
    where
        F: FnMut(&'static str) -> Option<FieldValue>;
}

/// Declare a record struct together with its [`OptimizerRecord`] field table.
///
/// Each field is written `name: Type => Packing`.
///
/// ```rust
/// use pybridge_optim::{OptimizerRecord, Packing, optimizer_record};
///
/// optimizer_record! {
///     /// Options of a toy optimizer.
///     pub struct ToyOptions {
///         /// Learning rate.
///         lr: f64 => Packing::LearningRate,
///         /// First smoothing factor.
///         beta1: f64 => Packing::Pair { key: "betas", index: 0 },
///         /// Second smoothing factor.
///         beta2: f64 => Packing::Pair { key: "betas", index: 1 },
///     }
/// }
///
/// assert_eq!(ToyOptions::FIELDS.len(), 3);
/// ```
#[macro_export]
macro_rules! optimizer_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty => $packing:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $crate::OptimizerRecord for $name {
            const FIELDS: &'static [$crate::FieldSpec] = &[
                $(
                    $crate::FieldSpec {
                        name: stringify!($field),
                        packing: $packing,
                        ty: <$ty as $crate::Field>::TYPE,
                    },
                )*
            ];

            fn field(&self, name: &str) -> Option<$crate::FieldValue> {
                match name {
                    $(stringify!($field) => Some($crate::Field::to_value(&self.$field)),)*
                    _ => None,
                }
            }

            fn set_field(
                &mut self,
                name: &str,
                value: $crate::FieldValue,
            ) -> Result<(), $crate::OptimStateError> {
                match name {
                    $(
                        stringify!($field) => {
                            self.$field = <$ty as $crate::Field>::from_value(name, value)?;
                        }
                    )*
                    _ => {
                        return Err($crate::OptimStateError::InvalidStructure(::std::format!(
                            "`{}` has no field `{name}`",
                            stringify!($name)
                        )));
                    }
                }
                Ok(())
            }

            fn from_fields<F>(mut lookup: F) -> Result<Self, $crate::OptimStateError>
            where
                F: FnMut(&'static str) -> Option<$crate::FieldValue>,
            {
                Ok(Self {
                    $(
                        $field: match lookup(stringify!($field)) {
                            Some(value) => {
                                <$ty as $crate::Field>::from_value(stringify!($field), value)?
                            }
                            None => <$ty as $crate::Field>::absent().ok_or_else(|| {
                                $crate::OptimStateError::InvalidStructure(::std::format!(
                                    "`{}` needs field `{}`",
                                    stringify!($name),
                                    stringify!($field)
                                ))
                            })?,
                        },
                    )*
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    optimizer_record! {
        /// Test record.
        pub struct Sample {
            lr: f64 => Packing::LearningRate,
            step: i64 => Packing::Step,
            buffer: Option<TensorData> => Packing::Plain,
        }
    }

    #[test]
    fn field_table_follows_declaration_order() {
        let names: Vec<&str> = Sample::FIELDS.iter().map(|spec| spec.name).collect();
        assert_eq!(names, vec!["lr", "step", "buffer"]);
        assert_eq!(Sample::FIELDS[1].packing, Packing::Step);
        assert_eq!(Sample::FIELDS[2].ty, FieldType::OptionalTensor);
    }

    #[test]
    fn set_field_checks_types() {
        let mut sample = Sample {
            lr: 0.1,
            step: 0,
            buffer: None,
        };
        sample.set_field("step", FieldValue::Float(4.0)).unwrap();
        assert_eq!(sample.step, 4);

        let err = sample.set_field("lr", FieldValue::Bool(true)).unwrap_err();
        assert!(matches!(
            err,
            OptimStateError::TypeMismatch { ref field, expected: FieldType::Float, .. } if field == "lr"
        ));
        assert!(matches!(
            sample.set_field("nope", FieldValue::None),
            Err(OptimStateError::InvalidStructure(_))
        ));
    }

    #[test]
    fn optional_tensors_may_be_absent() {
        let sample = Sample::from_fields(|name| match name {
            "lr" => Some(FieldValue::Float(0.5)),
            "step" => Some(FieldValue::Int(2)),
            _ => None,
        })
        .unwrap();
        assert_eq!(sample.buffer, None);

        let err = Sample::from_fields(|_| None).unwrap_err();
        assert!(matches!(err, OptimStateError::InvalidStructure(_)));
    }
}
