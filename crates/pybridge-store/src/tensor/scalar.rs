use half::{bf16, f16};

use super::DType;

/// A single value of any supported dtype, as unwrapped from a 0-d tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// 64-bit float.
    F64(f64),
    /// 32-bit float.
    F32(f32),
    /// Half precision float.
    F16(f16),
    /// Brain float.
    BF16(bf16),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit integer.
    I32(i32),
    /// 16-bit integer.
    I16(i16),
    /// 8-bit integer.
    I8(i8),
    /// Unsigned byte.
    U8(u8),
    /// Boolean.
    Bool(bool),
    /// Complex number with 32-bit parts.
    Complex64 {
        /// Real part.
        re: f32,
        /// Imaginary part.
        im: f32,
    },
    /// Complex number with 64-bit parts.
    Complex128 {
        /// Real part.
        re: f64,
        /// Imaginary part.
        im: f64,
    },
}

impl Scalar {
    /// The dtype the scalar was read from.
    pub fn dtype(&self) -> DType {
        match self {
            Scalar::F64(_) => DType::F64,
            Scalar::F32(_) => DType::F32,
            Scalar::F16(_) => DType::F16,
            Scalar::BF16(_) => DType::BF16,
            Scalar::I64(_) => DType::I64,
            Scalar::I32(_) => DType::I32,
            Scalar::I16(_) => DType::I16,
            Scalar::I8(_) => DType::I8,
            Scalar::U8(_) => DType::U8,
            Scalar::Bool(_) => DType::Bool,
            Scalar::Complex64 { .. } => DType::Complex64,
            Scalar::Complex128 { .. } => DType::Complex128,
        }
    }

    /// The value as a float, `None` for complex scalars.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match *self {
            Scalar::F64(v) => v,
            Scalar::F32(v) => v as f64,
            Scalar::F16(v) => v.to_f64(),
            Scalar::BF16(v) => v.to_f64(),
            Scalar::I64(v) => v as f64,
            Scalar::I32(v) => v as f64,
            Scalar::I16(v) => v as f64,
            Scalar::I8(v) => v as f64,
            Scalar::U8(v) => v as f64,
            Scalar::Bool(v) => v as u8 as f64,
            Scalar::Complex64 { .. } | Scalar::Complex128 { .. } => return None,
        };
        Some(value)
    }

    /// The value as an integer, `None` for floating point and complex scalars.
    pub fn as_i64(&self) -> Option<i64> {
        let value = match *self {
            Scalar::I64(v) => v,
            Scalar::I32(v) => v as i64,
            Scalar::I16(v) => v as i64,
            Scalar::I8(v) => v as i64,
            Scalar::U8(v) => v as i64,
            Scalar::Bool(v) => v as i64,
            // Step counters are stored as float tensors by some optimizers.
            Scalar::F64(v) if v.fract() == 0.0 => v as i64,
            Scalar::F32(v) if v.fract() == 0.0 => v as i64,
            _ => return None,
        };
        Some(value)
    }

    /// The value as a boolean, `None` unless the scalar is a bool or an integer.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Scalar::Bool(v) => Some(v),
            _ => self
                .as_i64()
                .filter(|_| !self.dtype().is_float())
                .map(|v| v != 0),
        }
    }
}
