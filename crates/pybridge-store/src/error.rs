use zip::result::ZipError;

use crate::applier::ApplyError;
use crate::pytorch::PickleError;
use crate::tensor::TensorError;

/// Hint attached to errors raised for whole-model saves.
pub(crate) const STATE_DICT_HINT: &str = "the checkpoint contains an entire model rather than a \
     state dict, re-save it using torch.save(model.state_dict(), ...)";

/// Errors raised while reading or writing checkpoints.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The container is malformed: bad zip layout, missing `data.pkl`, invalid JSON header.
    #[error("Format error: {0}")]
    Format(String),

    /// The file does not start with a zip local file header.
    #[error(
        "Legacy checkpoint format is not supported, re-save it with \
         torch.save(obj, path, _use_new_zipfile_serialization=True)"
    )]
    LegacyFormat,

    /// The pickle program references a constructor this codec does not rebuild.
    #[error("Unsupported constructor `{class}`: {hint}")]
    UnsupportedConstruct {
        /// Fully qualified `module.name` of the constructor.
        class: String,
        /// What the user can do about it.
        hint: String,
    },

    /// A storage class or safetensors dtype tag is not recognized.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A tensor byte range does not match its shape and dtype.
    #[error("Tensor `{name}` spans {found} bytes but its shape and dtype require {expected}")]
    LengthMismatch {
        /// Tensor name.
        name: String,
        /// Byte count implied by shape and dtype.
        expected: usize,
        /// Byte count recorded in the file.
        found: usize,
    },

    /// A deferred tensor was read a second time.
    #[error("Tensor storage `{0}` was already read")]
    Reuse(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip container error.
    #[error("Zip error: {0}")]
    Zip(#[from] ZipError),

    /// Low level pickle program error.
    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    /// Tensor view error.
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// Applying tensors to a module failed.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn unsupported_construct(module: &str, name: &str, hint: &str) -> Self {
        Self::UnsupportedConstruct {
            class: format!("{module}.{name}"),
            hint: hint.into(),
        }
    }
}
