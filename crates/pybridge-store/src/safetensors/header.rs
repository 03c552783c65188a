//! The JSON header of a safetensors file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use derive_new::new;
use serde::de::{Error, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::collections::OrderedMap;
use crate::tensor::DType;
use crate::StoreError;

/// Header key holding free-form string metadata instead of a tensor.
pub const METADATA_KEY: &str = "__metadata__";

/// Header alignment; the header is padded with spaces to a multiple of this.
const HEADER_ALIGNMENT: usize = 8;

/// Location and layout of one tensor in the data section.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct TensorInfo {
    /// Element type.
    pub dtype: DType,
    /// Shape, row-major.
    pub shape: Vec<usize>,
    /// Byte range `[start, end)` relative to the start of the data section.
    pub data_offsets: (usize, usize),
}

impl TensorInfo {
    /// Number of bytes in the data section.
    pub fn byte_len(&self) -> usize {
        self.data_offsets.1 - self.data_offsets.0
    }
}

#[derive(Serialize, Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Header entries in the order they appear in the file.
struct HeaderEntries(Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for HeaderEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = HeaderEntries;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of tensor names to tensor entries")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = BTreeSet::new();
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, serde_json::Value>()? {
                    if !seen.insert(name.clone()) {
                        return Err(A::Error::custom(format!("duplicate entry `{name}`")));
                    }
                    entries.push((name, value));
                }
                Ok(HeaderEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Parsed header: tensors ordered by data offset, and the optional metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Header {
    pub tensors: OrderedMap<String, TensorInfo>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Parse and validate a header against a data section of `data_len` bytes.
///
/// Every range must match its shape and dtype exactly, and the ranges must tile the data
/// section from byte zero without gaps or overlap. Tensors sharing a range, which only
/// happens for empty tensors, keep their file order.
pub(crate) fn parse_header(bytes: &[u8], data_len: usize) -> Result<Header, StoreError> {
    let HeaderEntries(raw) = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Format(format!("invalid safetensors header: {e}")))?;

    let mut metadata = None;
    let mut entries = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        if name == METADATA_KEY {
            let map: BTreeMap<String, String> = serde_json::from_value(value).map_err(|e| {
                StoreError::Format(format!("invalid safetensors metadata: {e}"))
            })?;
            metadata = Some(map);
            continue;
        }

        let entry: RawEntry = serde_json::from_value(value).map_err(|e| {
            StoreError::Format(format!("invalid header entry for `{name}`: {e}"))
        })?;
        let dtype = DType::from_safetensors_tag(&entry.dtype).ok_or_else(|| {
            StoreError::UnsupportedType(format!("safetensors dtype `{}`", entry.dtype))
        })?;
        let [start, end] = entry.data_offsets;
        if end < start {
            return Err(StoreError::Format(format!(
                "tensor `{name}` has a reversed byte range [{start}, {end})"
            )));
        }
        let expected = entry
            .shape
            .iter()
            .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| StoreError::Format(format!("tensor `{name}` is too large")))?;
        if end - start != expected {
            return Err(StoreError::LengthMismatch {
                name,
                expected,
                found: end - start,
            });
        }
        entries.push((name, TensorInfo::new(dtype, entry.shape, (start, end))));
    }

    entries.sort_by_key(|(_, info)| info.data_offsets);

    let mut cursor = 0;
    for (name, info) in entries.iter() {
        if info.data_offsets.0 != cursor {
            return Err(StoreError::Format(format!(
                "tensor `{name}` starts at byte {} but the previous tensor ends at {cursor}",
                info.data_offsets.0
            )));
        }
        cursor = info.data_offsets.1;
    }
    if cursor != data_len {
        return Err(StoreError::Format(format!(
            "tensors cover {cursor} bytes but the data section holds {data_len}"
        )));
    }

    Ok(Header {
        tensors: entries.into_iter().collect(),
        metadata,
    })
}

/// Header to serialize, entries in data order.
pub(crate) struct HeaderRef<'a> {
    pub metadata: Option<&'a BTreeMap<String, String>>,
    pub tensors: Vec<(&'a str, TensorInfo)>,
}

impl Serialize for HeaderRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.tensors.len() + usize::from(self.metadata.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(metadata) = self.metadata {
            map.serialize_entry(METADATA_KEY, metadata)?;
        }
        for (name, info) in self.tensors.iter() {
            let tag = info.dtype.safetensors_tag().ok_or_else(|| {
                serde::ser::Error::custom(format!("dtype {} has no safetensors tag", info.dtype))
            })?;
            let entry = RawEntry {
                dtype: tag.into(),
                shape: info.shape.clone(),
                data_offsets: [info.data_offsets.0, info.data_offsets.1],
            };
            map.serialize_entry(name, &entry)?;
        }
        map.end()
    }
}

impl HeaderRef<'_> {
    /// JSON bytes padded with spaces to the header alignment.
    pub(crate) fn to_padded_json(&self) -> Result<Vec<u8>, StoreError> {
        let mut json = serde_json::to_vec(self)?;
        let padded = json.len().next_multiple_of(HEADER_ALIGNMENT);
        json.resize(padded, b' ');
        Ok(json)
    }
}
