use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use half::{bf16, f16};

use super::{DType, Element, Scalar};

/// Errors raised when building or reading a tensor view.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    /// Shape and strides have different lengths.
    #[error("Shape {shape:?} and strides {strides:?} have different ranks")]
    RankMismatch {
        /// Shape of the view.
        shape: Vec<usize>,
        /// Strides of the view.
        strides: Vec<usize>,
    },

    /// The view addresses elements past the end of its storage.
    #[error("View needs {required} elements but its storage holds {available}")]
    OutOfBounds {
        /// Elements addressed by the view.
        required: usize,
        /// Elements held by the storage.
        available: usize,
    },

    /// A byte buffer does not match the shape and dtype it is given.
    #[error("Expected {expected} bytes for a {dtype} tensor of shape {shape:?}, found {found}")]
    ByteLength {
        /// Element type.
        dtype: DType,
        /// Tensor shape.
        shape: Vec<usize>,
        /// Byte count implied by shape and dtype.
        expected: usize,
        /// Actual byte count.
        found: usize,
    },

    /// The requested element type does not match the tensor dtype.
    #[error("Expected a {expected} tensor, found {found}")]
    DTypeMismatch {
        /// Requested dtype.
        expected: DType,
        /// Tensor dtype.
        found: DType,
    },

    /// The tensor holds more than one element.
    #[error("Tensor of shape {0:?} is not a scalar")]
    NotScalar(Vec<usize>),
}

/// Host tensor: a dtype/shape/stride/offset view over shared raw storage.
///
/// Views are never re-laid out on construction. [`TensorData::to_bytes`] gathers the logical
/// row-major bytes when the view is not contiguous.
#[derive(Clone)]
pub struct TensorData {
    storage: Arc<Vec<u8>>,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
}

/// Row-major strides of a shape, in elements.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1].max(1);
    }
    strides
}

impl TensorData {
    /// Create a contiguous tensor from values.
    ///
    /// # Panics
    ///
    /// If the number of values does not match the shape.
    pub fn new<E: Element, S: Into<Vec<usize>>>(values: Vec<E>, shape: S) -> Self {
        let shape = shape.into();
        let numel: usize = shape.iter().product();
        assert_eq!(
            values.len(),
            numel,
            "Shape {shape:?} is invalid for {} values",
            values.len()
        );

        let mut bytes = Vec::with_capacity(numel * E::DTYPE.size());
        for value in values.iter() {
            value.write_le(&mut bytes);
        }
        Self::contiguous(Arc::new(bytes), E::DTYPE, shape)
    }

    /// Create a 0-d tensor holding one value.
    pub fn scalar<E: Element>(value: E) -> Self {
        Self::new(vec![value], Vec::new())
    }

    /// Create a 0-d tensor from a [`Scalar`].
    pub fn from_scalar(value: Scalar) -> Self {
        match value {
            Scalar::F64(v) => Self::scalar(v),
            Scalar::F32(v) => Self::scalar(v),
            Scalar::F16(v) => Self::scalar(v),
            Scalar::BF16(v) => Self::scalar(v),
            Scalar::I64(v) => Self::scalar(v),
            Scalar::I32(v) => Self::scalar(v),
            Scalar::I16(v) => Self::scalar(v),
            Scalar::I8(v) => Self::scalar(v),
            Scalar::U8(v) => Self::scalar(v),
            Scalar::Bool(v) => Self::scalar(v),
            Scalar::Complex64 { re, im } => {
                let mut bytes = Vec::with_capacity(8);
                bytes.extend_from_slice(&re.to_le_bytes());
                bytes.extend_from_slice(&im.to_le_bytes());
                Self::contiguous(Arc::new(bytes), DType::Complex64, vec![])
            }
            Scalar::Complex128 { re, im } => {
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&re.to_le_bytes());
                bytes.extend_from_slice(&im.to_le_bytes());
                Self::contiguous(Arc::new(bytes), DType::Complex128, vec![])
            }
        }
    }

    /// Create a contiguous tensor filled with zeros.
    pub fn zeros<S: Into<Vec<usize>>>(dtype: DType, shape: S) -> Self {
        let shape = shape.into();
        let numel: usize = shape.iter().product();
        Self::contiguous(Arc::new(vec![0u8; numel * dtype.size()]), dtype, shape)
    }

    /// Create a contiguous tensor filled with one value.
    pub fn full<E: Element, S: Into<Vec<usize>>>(value: E, shape: S) -> Self {
        let shape = shape.into();
        let numel: usize = shape.iter().product();
        Self::new(vec![value; numel], shape)
    }

    /// Create a contiguous tensor from raw little-endian bytes.
    pub fn from_bytes<S: Into<Vec<usize>>>(
        bytes: Vec<u8>,
        shape: S,
        dtype: DType,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if bytes.len() != expected {
            return Err(TensorError::ByteLength {
                dtype,
                shape,
                expected,
                found: bytes.len(),
            });
        }
        Ok(Self::contiguous(Arc::new(bytes), dtype, shape))
    }

    /// Create a strided view over shared storage.
    ///
    /// `strides` and `storage_offset` count elements, not bytes. The view must stay within the
    /// storage: `storage_offset + sum(stride * (dim - 1)) + 1` elements at most.
    pub fn strided(
        storage: Arc<Vec<u8>>,
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
    ) -> Result<Self, TensorError> {
        if shape.len() != strides.len() {
            return Err(TensorError::RankMismatch { shape, strides });
        }

        let available = storage.len() / dtype.size();
        let required = view_extent(&shape, &strides, storage_offset).unwrap_or(usize::MAX);
        if required > available {
            return Err(TensorError::OutOfBounds {
                required,
                available,
            });
        }

        Ok(Self {
            storage,
            dtype,
            shape,
            strides,
            storage_offset,
        })
    }

    fn contiguous(storage: Arc<Vec<u8>>, dtype: DType, shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            storage,
            dtype,
            shape,
            strides,
            storage_offset: 0,
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Strides in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element in the storage, in elements.
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    /// The shared raw storage the view reads from.
    pub fn storage(&self) -> &Arc<Vec<u8>> {
        &self.storage
    }

    /// Number of logical elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes of the logical tensor.
    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }

    /// Whether the logical elements are laid out row-major without gaps.
    pub fn is_contiguous(&self) -> bool {
        if self.num_elements() <= 1 {
            return true;
        }
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&dim, (stride, expected))| dim == 1 || stride == expected)
    }

    /// Logical row-major bytes, borrowed from the storage when the view is contiguous.
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        if self.is_contiguous() {
            let start = self.storage_offset * self.dtype.size();
            return Cow::Borrowed(&self.storage[start..start + self.byte_len()]);
        }
        Cow::Owned(self.gather())
    }

    /// Convert into a contiguous tensor that owns exactly its logical bytes.
    pub fn into_contiguous(self) -> Self {
        if self.is_contiguous()
            && self.storage_offset == 0
            && self.storage.len() == self.byte_len()
        {
            return self;
        }
        let bytes = self.to_bytes().into_owned();
        Self::contiguous(Arc::new(bytes), self.dtype, self.shape)
    }

    /// Copy the logical elements out as a vector.
    pub fn to_vec<E: Element>(&self) -> Result<Vec<E>, TensorError> {
        if E::DTYPE != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: E::DTYPE,
                found: self.dtype,
            });
        }
        let size = self.dtype.size();
        Ok(self.to_bytes().chunks_exact(size).map(E::read_le).collect())
    }

    /// Unwrap a single-element tensor into a [`Scalar`].
    pub fn to_scalar(&self) -> Result<Scalar, TensorError> {
        if self.num_elements() != 1 {
            return Err(TensorError::NotScalar(self.shape.clone()));
        }
        let bytes = self.to_bytes();
        let b = bytes.as_ref();
        let scalar = match self.dtype {
            DType::F64 => Scalar::F64(f64::read_le(b)),
            DType::F32 => Scalar::F32(f32::read_le(b)),
            DType::F16 => Scalar::F16(f16::read_le(b)),
            DType::BF16 => Scalar::BF16(bf16::read_le(b)),
            DType::I64 => Scalar::I64(i64::read_le(b)),
            DType::I32 => Scalar::I32(i32::read_le(b)),
            DType::I16 => Scalar::I16(i16::read_le(b)),
            DType::I8 => Scalar::I8(i8::read_le(b)),
            DType::U8 => Scalar::U8(u8::read_le(b)),
            DType::Bool => Scalar::Bool(bool::read_le(b)),
            DType::Complex64 => Scalar::Complex64 {
                re: f32::read_le(&b[..4]),
                im: f32::read_le(&b[4..]),
            },
            DType::Complex128 => Scalar::Complex128 {
                re: f64::read_le(&b[..8]),
                im: f64::read_le(&b[8..]),
            },
        };
        Ok(scalar)
    }

    fn gather(&self) -> Vec<u8> {
        let size = self.dtype.size();
        let numel = self.num_elements();
        let mut out = Vec::with_capacity(numel * size);
        if numel == 0 {
            return out;
        }

        let rank = self.shape.len();
        let mut index = vec![0usize; rank];
        let mut pos = self.storage_offset;
        for _ in 0..numel {
            let start = pos * size;
            out.extend_from_slice(&self.storage[start..start + size]);

            for dim in (0..rank).rev() {
                index[dim] += 1;
                pos += self.strides[dim];
                if index[dim] < self.shape[dim] {
                    break;
                }
                pos -= self.strides[dim] * self.shape[dim];
                index[dim] = 0;
            }
        }
        out
    }
}

impl PartialEq for TensorData {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.to_bytes() == other.to_bytes()
    }
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("storage_offset", &self.storage_offset)
            .field("storage_bytes", &self.storage.len())
            .finish()
    }
}

/// Number of storage elements a strided view spans, `None` if it overflows `usize`.
///
/// A view with an empty dimension spans nothing.
pub(crate) fn view_extent(shape: &[usize], strides: &[usize], offset: usize) -> Option<usize> {
    if shape.iter().any(|&dim| dim == 0) {
        return Some(0);
    }
    shape
        .iter()
        .zip(strides.iter())
        .try_fold(offset, |acc, (dim, stride)| {
            stride.checked_mul(dim - 1).and_then(|span| acc.checked_add(span))
        })?
        .checked_add(1)
}
