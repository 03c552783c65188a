use half::{bf16, f16};

use super::DType;

/// A host scalar type that can be stored in a [`TensorData`](super::TensorData).
///
/// Elements are always laid out little-endian, which is the only byte order the checkpoint
/// formats use.
pub trait Element: Copy + std::fmt::Debug + PartialEq + 'static {
    /// The dtype of the element.
    const DTYPE: DType;

    /// Append the little-endian bytes of the element.
    fn write_le(&self, out: &mut std::vec::Vec<u8>);

    /// Read an element from exactly `DTYPE.size()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! element {
    ($ty:ty, $dtype:expr, $size:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(&self, out: &mut std::vec::Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

element!(f64, DType::F64, 8);
element!(f32, DType::F32, 4);
element!(f16, DType::F16, 2);
element!(bf16, DType::BF16, 2);
element!(i64, DType::I64, 8);
element!(i32, DType::I32, 4);
element!(i16, DType::I16, 2);
element!(i8, DType::I8, 1);
element!(u8, DType::U8, 1);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_le(&self, out: &mut std::vec::Vec<u8>) {
        out.push(*self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}
