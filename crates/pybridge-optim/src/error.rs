use pybridge_store::{DType, StoreError};

use crate::record::FieldType;

/// Errors raised while transcoding optimizer state.
#[derive(thiserror::Error, Debug)]
pub enum OptimStateError {
    /// The checkpoint and the live optimizer have a different number of parameter groups.
    #[error("Optimizer has {expected} parameter groups but the checkpoint has {found}")]
    GroupCountMismatch {
        /// Groups in the live optimizer.
        expected: usize,
        /// Groups in the checkpoint.
        found: usize,
    },

    /// A checkpoint group holds a different number of parameters than its live counterpart.
    #[error("Parameter group {group} has {expected} parameters but the checkpoint group has {found}")]
    ParamCountMismatch {
        /// Index of the group.
        group: usize,
        /// Parameters in the live group.
        expected: usize,
        /// Parameters in the checkpoint group.
        found: usize,
    },

    /// A 0-d tensor cannot be unwrapped into the scalar type of its field.
    #[error("Field `{field}` holds a {dtype} tensor that cannot be read as a scalar")]
    UnsupportedScalar {
        /// Field name.
        field: String,
        /// Dtype of the stored tensor.
        dtype: DType,
    },

    /// A stored value has the wrong type for its field.
    #[error("Field `{field}` expects {expected}, found {found}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Type declared by the field table.
        expected: FieldType,
        /// Description of the stored value.
        found: String,
    },

    /// The generic structure does not have the `state_dict` layout.
    #[error("Invalid optimizer state: {0}")]
    InvalidStructure(String),

    /// Reading or writing the checkpoint archive failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
