use std::fmt;

/// Element type of a tensor storage.
///
/// The set matches the storage classes PyTorch writes into its archives. Only the real-valued
/// variants have a safetensors tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 64-bit float.
    F64,
    /// 32-bit float.
    F32,
    /// IEEE half precision float.
    F16,
    /// Brain float.
    BF16,
    /// 64-bit signed integer.
    I64,
    /// 32-bit signed integer.
    I32,
    /// 16-bit signed integer.
    I16,
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
    /// Boolean, one byte per element.
    Bool,
    /// Complex number made of two 32-bit floats.
    Complex64,
    /// Complex number made of two 64-bit floats.
    Complex128,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 | DType::Complex64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::Complex128 => 16,
        }
    }

    /// Resolve the dtype of a PyTorch storage class, e.g. `FloatStorage`.
    pub fn from_storage_type(name: &str) -> Option<Self> {
        let dtype = match name {
            "DoubleStorage" => DType::F64,
            "FloatStorage" => DType::F32,
            "HalfStorage" => DType::F16,
            "BFloat16Storage" => DType::BF16,
            "LongStorage" => DType::I64,
            "IntStorage" => DType::I32,
            "ShortStorage" => DType::I16,
            "CharStorage" => DType::I8,
            "ByteStorage" => DType::U8,
            "BoolStorage" => DType::Bool,
            "ComplexFloatStorage" => DType::Complex64,
            "ComplexDoubleStorage" => DType::Complex128,
            _ => return None,
        };
        Some(dtype)
    }

    /// The PyTorch storage class written for this dtype.
    pub const fn storage_type(&self) -> &'static str {
        match self {
            DType::F64 => "DoubleStorage",
            DType::F32 => "FloatStorage",
            DType::F16 => "HalfStorage",
            DType::BF16 => "BFloat16Storage",
            DType::I64 => "LongStorage",
            DType::I32 => "IntStorage",
            DType::I16 => "ShortStorage",
            DType::I8 => "CharStorage",
            DType::U8 => "ByteStorage",
            DType::Bool => "BoolStorage",
            DType::Complex64 => "ComplexFloatStorage",
            DType::Complex128 => "ComplexDoubleStorage",
        }
    }

    /// Resolve a safetensors dtype tag, e.g. `F32`.
    pub fn from_safetensors_tag(tag: &str) -> Option<Self> {
        let dtype = match tag {
            "F64" => DType::F64,
            "F32" => DType::F32,
            "F16" => DType::F16,
            "BF16" => DType::BF16,
            "I64" => DType::I64,
            "I32" => DType::I32,
            "I16" => DType::I16,
            "I8" => DType::I8,
            "U8" => DType::U8,
            "BOOL" => DType::Bool,
            _ => return None,
        };
        Some(dtype)
    }

    /// The safetensors tag of this dtype, `None` for complex types.
    pub const fn safetensors_tag(&self) -> Option<&'static str> {
        match self {
            DType::F64 => Some("F64"),
            DType::F32 => Some("F32"),
            DType::F16 => Some("F16"),
            DType::BF16 => Some("BF16"),
            DType::I64 => Some("I64"),
            DType::I32 => Some("I32"),
            DType::I16 => Some("I16"),
            DType::I8 => Some("I8"),
            DType::U8 => Some("U8"),
            DType::Bool => Some("BOOL"),
            DType::Complex64 | DType::Complex128 => None,
        }
    }

    /// Whether the dtype is a floating point type (complex excluded).
    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }

    /// Whether the dtype is a complex type.
    pub const fn is_complex(&self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "float64",
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::I16 => "int16",
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::Bool => "bool",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DType; 12] = [
        DType::F64,
        DType::F32,
        DType::F16,
        DType::BF16,
        DType::I64,
        DType::I32,
        DType::I16,
        DType::I8,
        DType::U8,
        DType::Bool,
        DType::Complex64,
        DType::Complex128,
    ];

    #[test]
    fn storage_type_table_is_bijective() {
        for dtype in ALL {
            assert_eq!(DType::from_storage_type(dtype.storage_type()), Some(dtype));
        }
        assert_eq!(DType::from_storage_type("QInt8Storage"), None);
    }

    #[test]
    fn complex_types_have_no_safetensors_tag() {
        for dtype in ALL {
            match dtype.safetensors_tag() {
                Some(tag) => assert_eq!(DType::from_safetensors_tag(tag), Some(dtype)),
                None => assert!(dtype.is_complex()),
            }
        }
        assert_eq!(DType::from_safetensors_tag("F8_E4M3"), None);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(DType::Complex128.size(), 16);
        assert_eq!(DType::BF16.size(), 2);
        assert_eq!(DType::Bool.size(), 1);
    }
}
