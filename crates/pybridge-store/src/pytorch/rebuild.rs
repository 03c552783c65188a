//! Tensor materialization from `_rebuild_tensor` / `_rebuild_tensor_v2` arguments.

use std::cell::Cell;
use std::rc::Rc;

use crate::pytorch::storage::StorageRecord;
use crate::pytorch::value::{PickleValue, TensorRef};
use crate::tensor::{DType, TensorData, view_extent};
use crate::StoreError;

/// Arguments of a tensor rebuild call: a view over one storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    /// Storage the view reads from.
    pub storage: Rc<StorageRecord>,
    /// Offset of the first element, in elements.
    pub storage_offset: usize,
    /// Logical shape.
    pub shape: Vec<usize>,
    /// Strides in elements.
    pub strides: Vec<usize>,
    /// Recorded `requires_grad` flag. Gradients are never re-enabled on load.
    pub requires_grad: bool,
}

impl TensorDescriptor {
    /// Parse `(storage, storage_offset, size, stride[, requires_grad, backward_hooks, ...])`.
    pub fn from_args(args: &[PickleValue]) -> Result<Self, StoreError> {
        if args.len() < 4 {
            return Err(StoreError::Format(format!(
                "tensor rebuild expects at least 4 arguments, got {}",
                args.len()
            )));
        }

        let storage = match &args[0] {
            PickleValue::Storage(record) => record.clone(),
            other => {
                return Err(StoreError::Format(format!(
                    "tensor rebuild expects a storage, got {}",
                    other.type_name()
                )));
            }
        };
        let storage_offset = match args[1].as_int() {
            Some(offset) if offset >= 0 => offset as usize,
            _ => {
                return Err(StoreError::Format(format!(
                    "invalid storage offset {:?}",
                    args[1]
                )));
            }
        };
        let shape = args[2].to_usize_vec("tensor size")?;
        // Negative strides are not produced by the reference writer and are rejected here.
        let strides = args[3].to_usize_vec("tensor stride")?;
        let requires_grad = matches!(args.get(4), Some(PickleValue::Bool(true)));

        Ok(Self {
            storage,
            storage_offset,
            shape,
            strides,
            requires_grad,
        })
    }

    /// Element type of the view.
    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    /// Build the tensor. Deferred storages yield a [`DeferredTensor`].
    pub fn materialize(self) -> Result<TensorRef, StoreError> {
        if self.storage.is_loaded() {
            return self.into_data().map(TensorRef::Loaded);
        }

        // Validate the view against the declared storage size before any byte is read.
        let required = view_extent(&self.shape, &self.strides, self.storage_offset)
            .unwrap_or(usize::MAX);
        if required > self.storage.num_elements {
            return Err(crate::tensor::TensorError::OutOfBounds {
                required,
                available: self.storage.num_elements,
            }
            .into());
        }
        Ok(TensorRef::Deferred(DeferredTensor {
            descriptor: self,
            consumed: Rc::new(Cell::new(false)),
        }))
    }

    fn into_data(self) -> Result<TensorData, StoreError> {
        let bytes = self.storage.read()?;
        Ok(TensorData::strided(
            bytes,
            self.storage.dtype,
            self.shape,
            self.strides,
            self.storage_offset,
        )?)
    }
}

/// A tensor whose bytes are still in the archive.
///
/// The handle reads once; clones share that single read.
#[derive(Debug, Clone)]
pub struct DeferredTensor {
    descriptor: TensorDescriptor,
    consumed: Rc<Cell<bool>>,
}

impl DeferredTensor {
    /// Element type.
    pub fn dtype(&self) -> DType {
        self.descriptor.dtype()
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    /// View description.
    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.descriptor
    }

    /// Whether the bytes have already been read.
    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    /// Read the tensor bytes. Fails with [`StoreError::Reuse`] on a second call.
    pub fn load(&self) -> Result<TensorData, StoreError> {
        if self.consumed.replace(true) {
            return Err(StoreError::Reuse(self.descriptor.storage.key.clone()));
        }
        self.descriptor.clone().into_data()
    }
}

impl PartialEq for DeferredTensor {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}
