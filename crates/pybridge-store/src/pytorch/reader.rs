//! Reading `torch.save` zip archives.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use crate::archive::ArchiveReader;
use crate::collections::OrderedMap;
use crate::pytorch::pickle_reader::read_pickle_with;
use crate::pytorch::rebuild::DeferredTensor;
use crate::pytorch::storage::{StorageResolver, TensorLoading};
use crate::pytorch::value::{DictKey, PickleValue, TensorRef};
use crate::{StateDict, StoreError};

/// Reader over one checkpoint archive.
///
/// # Example
///
/// ```rust,no_run
/// use pybridge_store::pytorch::PytorchReader;
///
/// let reader = PytorchReader::from_file("pytorch_model.bin")?;
/// for (name, tensor) in reader.read_state_dict()?.iter() {
///     println!("{name}: {:?} {:?}", tensor.dtype(), tensor.shape());
/// }
/// # Ok::<(), pybridge_store::StoreError>(())
/// ```
#[derive(Clone)]
pub struct PytorchReader {
    archive: ArchiveReader,
}

impl PytorchReader {
    /// Open a checkpoint from any seekable source.
    pub fn new<R: Read + Seek + 'static>(reader: R) -> Result<Self, StoreError> {
        Ok(Self {
            archive: ArchiveReader::new(reader)?,
        })
    }

    /// Open an in-memory checkpoint.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, StoreError> {
        Self::new(Cursor::new(bytes.into()))
    }

    /// Open a checkpoint file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }

    /// Decode the whole pickled object.
    ///
    /// With [`TensorLoading::Deferred`] tensors come back as [`TensorRef::Deferred`] and no
    /// storage bytes are read until each tensor is loaded.
    pub fn read_value(&self, loading: TensorLoading) -> Result<PickleValue, StoreError> {
        let program = self.archive.pickle_entry()?.read()?;
        let mut resolver = StorageResolver::new(self.archive.clone(), loading);
        read_pickle_with(&mut Cursor::new(program), &mut resolver)
    }

    /// Decode the checkpoint as a state dict, reading every tensor.
    pub fn read_state_dict(&self) -> Result<StateDict, StoreError> {
        let value = self.read_value(TensorLoading::Eager)?;
        let mut state_dict = StateDict::new();
        for (name, tensor) in collect_tensors(&value)? {
            state_dict.insert(name, tensor.load()?);
        }
        Ok(state_dict)
    }

    /// Decode the tensor index without reading tensor bytes.
    pub fn read_lazy_state_dict(&self) -> Result<OrderedMap<String, DeferredTensor>, StoreError> {
        let value = self.read_value(TensorLoading::Deferred)?;
        let mut tensors = OrderedMap::new();
        for (name, tensor) in collect_tensors(&value)? {
            match tensor {
                TensorRef::Deferred(deferred) => {
                    tensors.insert(name, deferred.clone());
                }
                TensorRef::Loaded(_) => {
                    return Err(StoreError::Format(format!(
                        "tensor `{name}` was loaded while reading the index"
                    )));
                }
            }
        }
        Ok(tensors)
    }
}

/// Decode an in-memory checkpoint into a state dict.
pub fn decode_checkpoint(bytes: &[u8]) -> Result<StateDict, StoreError> {
    PytorchReader::from_bytes(bytes.to_vec())?.read_state_dict()
}

/// Flatten the tensors of a decoded root, nested dictionaries joined with `.`.
fn collect_tensors(root: &PickleValue) -> Result<Vec<(String, &TensorRef)>, StoreError> {
    let dict = root.as_dict().ok_or_else(|| {
        StoreError::Format(format!(
            "expected the checkpoint to hold a dict, found {}",
            root.type_name()
        ))
    })?;

    let mut tensors = Vec::new();
    let mut path = Vec::new();
    collect_into(dict.iter(), &mut path, &mut tensors);
    Ok(tensors)
}

fn collect_into<'a>(
    entries: impl Iterator<Item = (&'a DictKey, &'a PickleValue)>,
    path: &mut Vec<String>,
    tensors: &mut Vec<(String, &'a TensorRef)>,
) {
    for (key, value) in entries {
        path.push(key.to_string());
        match value {
            PickleValue::Tensor(tensor) => tensors.push((path.join("."), tensor)),
            PickleValue::Dict(dict) | PickleValue::OrderedDict(dict) => {
                collect_into(dict.iter(), path, tensors)
            }
            other => log::warn!(
                "Skipping non-tensor entry `{}` of type {}",
                path.join("."),
                other.type_name()
            ),
        }
        path.pop();
    }
}
