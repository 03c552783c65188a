//! Resolution of persistent storage references to archive entries.

use std::rc::Rc;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::archive::{ArchiveEntry, ArchiveReader};
use crate::error::STATE_DICT_HINT;
use crate::pytorch::value::PickleValue;
use crate::tensor::DType;
use crate::StoreError;

/// How tensor bytes are fetched while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLoading {
    /// Read every storage while decoding.
    #[default]
    Eager,
    /// Keep unread handles; each tensor reads its bytes once, on demand.
    Deferred,
}

/// Hook invoked by the pickle decoder for `PERSID`/`BINPERSID`.
pub trait PersistentLoad {
    /// Turn a persistent id into a value.
    fn persistent_load(&mut self, pid: PickleValue) -> Result<PickleValue, StoreError>;
}

#[derive(Clone)]
pub(crate) enum StorageBytes {
    Loaded(Arc<Vec<u8>>),
    Deferred(ArchiveEntry),
}

/// A resolved `("storage", class, key, device, numel)` persistent id.
pub struct StorageRecord {
    /// Element type from the storage class.
    pub dtype: DType,
    /// Archive key, the `<key>` of `data/<key>`.
    pub key: String,
    /// Device the storage was saved from. Always materialized on the host.
    pub device: String,
    /// Number of elements in the storage.
    pub num_elements: usize,
    pub(crate) bytes: StorageBytes,
}

impl StorageRecord {
    /// Size in bytes implied by the element count.
    pub fn byte_len(&self) -> usize {
        self.num_elements * self.dtype.size()
    }

    /// Whether the bytes were read during decoding.
    pub fn is_loaded(&self) -> bool {
        matches!(self.bytes, StorageBytes::Loaded(_))
    }

    pub(crate) fn read(&self) -> Result<Arc<Vec<u8>>, StoreError> {
        match &self.bytes {
            StorageBytes::Loaded(bytes) => Ok(bytes.clone()),
            StorageBytes::Deferred(entry) => {
                let bytes = entry.read()?;
                check_storage_len(&self.key, self.byte_len(), bytes.len())?;
                Ok(Arc::new(bytes))
            }
        }
    }
}

impl PartialEq for StorageRecord {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.key == other.key
            && self.num_elements == other.num_elements
    }
}

impl std::fmt::Debug for StorageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRecord")
            .field("dtype", &self.dtype)
            .field("key", &self.key)
            .field("device", &self.device)
            .field("num_elements", &self.num_elements)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn check_storage_len(key: &str, expected: usize, found: usize) -> Result<(), StoreError> {
    if found < expected {
        return Err(StoreError::LengthMismatch {
            name: format!("storage {key}"),
            expected,
            found,
        });
    }
    Ok(())
}

/// Resolves storage persistent ids against an open archive.
pub struct StorageResolver {
    archive: ArchiveReader,
    loading: TensorLoading,
    resolved: HashMap<String, Rc<StorageRecord>>,
}

impl StorageResolver {
    /// Create a resolver for an archive.
    pub fn new(archive: ArchiveReader, loading: TensorLoading) -> Self {
        Self {
            archive,
            loading,
            resolved: HashMap::new(),
        }
    }

    /// Resolve a persistent id tuple to a storage record.
    ///
    /// A key seen before resolves to the same record, so views aliasing one storage share it.
    pub fn resolve(&mut self, pid: &PickleValue) -> Result<Rc<StorageRecord>, StoreError> {
        let items = match pid {
            PickleValue::Tuple(items) => items.as_slice(),
            other => {
                return Err(StoreError::Format(format!(
                    "persistent id must be a tuple, got {}",
                    other.type_name()
                )));
            }
        };

        let kind = items.first().and_then(PickleValue::as_str).unwrap_or("");
        if kind != "storage" {
            return Err(StoreError::UnsupportedConstruct {
                class: format!("persistent id `{kind}`"),
                hint: STATE_DICT_HINT.into(),
            });
        }
        if items.len() != 5 {
            return Err(StoreError::Format(format!(
                "storage persistent id must have 5 items, got {}",
                items.len()
            )));
        }

        let class = match &items[1] {
            PickleValue::Global { name, .. } => name.as_str(),
            PickleValue::String(name) => name.as_str(),
            other => {
                return Err(StoreError::Format(format!(
                    "storage class must be a global, got {}",
                    other.type_name()
                )));
            }
        };
        let dtype = DType::from_storage_type(class)
            .ok_or_else(|| StoreError::UnsupportedType(format!("storage class `{class}`")))?;
        let key = match &items[2] {
            PickleValue::String(key) => key.clone(),
            PickleValue::Int(key) => key.to_string(),
            other => {
                return Err(StoreError::Format(format!(
                    "storage key must be a string, got {}",
                    other.type_name()
                )));
            }
        };
        let device = items[3].as_str().unwrap_or("cpu").to_string();
        let num_elements = match items[4].as_int() {
            Some(n) if n >= 0 && (n as usize).checked_mul(dtype.size()).is_some() => n as usize,
            _ => {
                return Err(StoreError::Format(format!(
                    "storage `{key}` has an invalid element count"
                )));
            }
        };

        if let Some(record) = self.resolved.get(&key) {
            return Ok(record.clone());
        }

        let entry = self.archive.storage_entry(&key)?;
        let bytes = match self.loading {
            TensorLoading::Eager => {
                let bytes = entry.read()?;
                check_storage_len(&key, num_elements * dtype.size(), bytes.len())?;
                StorageBytes::Loaded(Arc::new(bytes))
            }
            TensorLoading::Deferred => StorageBytes::Deferred(entry),
        };
        if device != "cpu" {
            log::debug!("Storage {key} was saved on {device}, loading it on the host");
        }

        let record = Rc::new(StorageRecord {
            dtype,
            key: key.clone(),
            device,
            num_elements,
            bytes,
        });
        self.resolved.insert(key, record.clone());
        Ok(record)
    }
}

impl PersistentLoad for StorageResolver {
    fn persistent_load(&mut self, pid: PickleValue) -> Result<PickleValue, StoreError> {
        self.resolve(&pid).map(PickleValue::Storage)
    }
}
