use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::header::{HeaderRef, METADATA_KEY, TensorInfo};
use crate::{StateDict, StoreError};

/// Write a state dict in safetensors layout.
///
/// Tensors are laid out in state dict order. Complex tensors have no safetensors tag and are
/// rejected with [`StoreError::UnsupportedType`].
pub fn write_safetensors<W: Write>(
    state_dict: &StateDict,
    metadata: Option<&BTreeMap<String, String>>,
    writer: &mut W,
) -> Result<(), StoreError> {
    let mut tensors = Vec::with_capacity(state_dict.len());
    let mut offset = 0;
    for (name, tensor) in state_dict.iter() {
        if name == METADATA_KEY {
            return Err(StoreError::Format(format!(
                "`{METADATA_KEY}` is reserved and cannot name a tensor"
            )));
        }
        if tensor.dtype().safetensors_tag().is_none() {
            return Err(StoreError::UnsupportedType(format!(
                "{} tensor `{name}` cannot be stored in safetensors",
                tensor.dtype()
            )));
        }
        let end = offset + tensor.byte_len();
        tensors.push((
            name,
            TensorInfo::new(tensor.dtype(), tensor.shape().to_vec(), (offset, end)),
        ));
        offset = end;
    }

    let header = HeaderRef { metadata, tensors }.to_padded_json()?;
    writer.write_u64::<LittleEndian>(header.len() as u64)?;
    writer.write_all(&header)?;
    for (_, tensor) in state_dict.iter() {
        writer.write_all(&tensor.to_bytes())?;
    }
    Ok(())
}

/// Encode a state dict into safetensors bytes.
pub fn encode_safetensors(state_dict: &StateDict) -> Result<Vec<u8>, StoreError> {
    encode_safetensors_with_metadata(state_dict, None)
}

/// Encode a state dict into safetensors bytes with a `__metadata__` map.
pub fn encode_safetensors_with_metadata(
    state_dict: &StateDict,
    metadata: Option<&BTreeMap<String, String>>,
) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    write_safetensors(state_dict, metadata, &mut bytes)?;
    Ok(bytes)
}
