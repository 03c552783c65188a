//! Safetensors support.
//!
//! A safetensors file is an 8-byte little-endian header length, a JSON header mapping tensor
//! names to `{"dtype", "shape", "data_offsets"}` (plus an optional `__metadata__` string map),
//! and the raw little-endian tensor bytes laid out in header offset order.
//!
//! # Usage
//!
//! ```rust
//! use pybridge_store::safetensors::{decode_safetensors, encode_safetensors};
//! use pybridge_store::{KeyFilter, StateDict, TensorData};
//!
//! let state_dict: StateDict = [
//!     ("encoder.weight", TensorData::full(1.0f32, [2, 2])),
//!     ("decoder.weight", TensorData::full(2.0f32, [2, 2])),
//! ]
//! .into_iter()
//! .collect();
//!
//! let bytes = encode_safetensors(&state_dict)?;
//! let filter = KeyFilter::new().with_key("decoder.weight");
//! let partial = decode_safetensors(&bytes, Some(&filter))?;
//! assert_eq!(partial.len(), 1);
//! # Ok::<(), pybridge_store::StoreError>(())
//! ```

mod header;
mod reader;
mod store;
mod writer;

pub use header::{METADATA_KEY, TensorInfo};
pub use reader::SafetensorsReader;
pub use store::SafetensorsStore;
pub use writer::{encode_safetensors, encode_safetensors_with_metadata, write_safetensors};

use std::io::Cursor;

use crate::{KeyFilter, StateDict, StoreError};

/// Decode safetensors bytes, reading only the tensors selected by `filter`.
pub fn decode_safetensors(
    bytes: &[u8],
    filter: Option<&KeyFilter>,
) -> Result<StateDict, StoreError> {
    let mut reader = SafetensorsReader::new(Cursor::new(bytes))?;
    match filter {
        Some(filter) => reader.read_filtered(|name| filter.matches(name)),
        None => reader.read_state_dict(),
    }
}

#[cfg(test)]
mod tests;
