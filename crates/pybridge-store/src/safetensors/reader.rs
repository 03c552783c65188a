use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use super::header::{TensorInfo, parse_header};
use crate::collections::OrderedMap;
use crate::tensor::TensorData;
use crate::{StateDict, StoreError};

/// Reader over one safetensors file.
///
/// The header is parsed and validated on construction; tensor bytes are read on demand, so
/// selecting a subset of tensors only reads their byte ranges.
pub struct SafetensorsReader<R> {
    reader: R,
    index: OrderedMap<String, TensorInfo>,
    metadata: Option<BTreeMap<String, String>>,
    data_start: u64,
}

impl SafetensorsReader<BufReader<File>> {
    /// Open a safetensors file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::new(BufReader::new(File::open(path.as_ref())?))
    }
}

impl SafetensorsReader<Cursor<Vec<u8>>> {
    /// Read from an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, StoreError> {
        Self::new(Cursor::new(bytes.into()))
    }
}

impl<R: Read + Seek> SafetensorsReader<R> {
    /// Parse the header of a seekable source.
    pub fn new(mut reader: R) -> Result<Self, StoreError> {
        let total = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        if total < 8 {
            return Err(StoreError::Format(format!(
                "safetensors data of {total} bytes is shorter than the header length"
            )));
        }

        let header_len = reader.read_u64::<LittleEndian>()?;
        if header_len > total - 8 {
            return Err(StoreError::Format(format!(
                "header length {header_len} exceeds the {} available bytes",
                total - 8
            )));
        }
        let mut header = vec![0u8; header_len as usize];
        reader.read_exact(&mut header)?;

        let data_start = 8 + header_len;
        let parsed = parse_header(&header, (total - data_start) as usize)?;
        Ok(Self {
            reader,
            index: parsed.tensors,
            metadata: parsed.metadata,
            data_start,
        })
    }

    /// Tensor layout by name, in data order. No tensor bytes are read.
    pub fn index(&self) -> &OrderedMap<String, TensorInfo> {
        &self.index
    }

    /// Tensor names in data order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// The `__metadata__` map, if the header has one.
    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref()
    }

    /// Read one tensor.
    pub fn read_tensor(&mut self, name: &str) -> Result<TensorData, StoreError> {
        let info = self
            .index
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Format(format!("no tensor named `{name}`")))?;
        self.reader
            .seek(SeekFrom::Start(self.data_start + info.data_offsets.0 as u64))?;
        self.read_bytes(&info)
    }

    /// Read every tensor.
    pub fn read_state_dict(&mut self) -> Result<StateDict, StoreError> {
        self.read_filtered(|_| true)
    }

    /// Read the tensors whose name is selected, in data order.
    ///
    /// Consecutive selected tensors are read without seeking.
    pub fn read_filtered(
        &mut self,
        mut select: impl FnMut(&str) -> bool,
    ) -> Result<StateDict, StoreError> {
        let selected: Vec<(String, TensorInfo)> = self
            .index
            .iter()
            .filter(|(name, _)| select(name.as_str()))
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        let skipped = self.index.len() - selected.len();
        if skipped > 0 {
            log::debug!("Leaving {skipped} safetensors entries unread");
        }

        let mut position = None;
        let mut state_dict = StateDict::new();
        for (name, info) in selected {
            let start = self.data_start + info.data_offsets.0 as u64;
            if position != Some(start) {
                self.reader.seek(SeekFrom::Start(start))?;
            }
            let tensor = self.read_bytes(&info)?;
            position = Some(start + info.byte_len() as u64);
            state_dict.insert(name, tensor);
        }
        Ok(state_dict)
    }

    /// Give back the underlying source.
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_bytes(&mut self, info: &TensorInfo) -> Result<TensorData, StoreError> {
        let mut bytes = vec![0u8; info.byte_len()];
        self.reader.read_exact(&mut bytes)?;
        Ok(TensorData::from_bytes(bytes, info.shape.clone(), info.dtype)?)
    }
}
