//! Writing `torch.save` compatible zip archives.

use std::io::{Cursor, Seek, Write};

use crate::archive::ArchiveWriter;
use crate::pytorch::pickle_writer::write_pickle;
use crate::pytorch::value::PickleValue;
use crate::{StateDict, StoreError};

/// Writer producing the zip layout of `torch.save`:
/// `<name>/data.pkl`, `<name>/byteorder`, `<name>/data/<i>` and `<name>/version`.
#[derive(Debug, Clone)]
pub struct PytorchWriter {
    archive_name: String,
}

impl Default for PytorchWriter {
    fn default() -> Self {
        Self {
            archive_name: "archive".into(),
        }
    }
}

impl PytorchWriter {
    /// Create a writer using the default `archive` entry prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry prefix, `torch.save` uses the file stem.
    pub fn with_archive_name(mut self, name: impl Into<String>) -> Self {
        self.archive_name = name.into();
        self
    }

    /// Encode any value tree into `writer`.
    pub fn write_value<W: Write + Seek>(
        &self,
        value: &PickleValue,
        writer: W,
    ) -> Result<W, StoreError> {
        let encoded = write_pickle(value)?;
        log::debug!(
            "Writing checkpoint archive `{}` with {} storages",
            self.archive_name,
            encoded.storages.len()
        );

        let mut archive = ArchiveWriter::new(writer, &self.archive_name);
        archive.write_entry("data.pkl", &encoded.program)?;
        archive.write_entry("byteorder", b"little")?;
        for (key, bytes) in encoded.storages.iter().enumerate() {
            archive.write_entry(&format!("data/{key}"), bytes)?;
        }
        archive.write_entry("version", b"3\n")?;
        archive.finish()
    }

    /// Encode a state dict into `writer`.
    pub fn write_state_dict<W: Write + Seek>(
        &self,
        state_dict: &StateDict,
        writer: W,
    ) -> Result<W, StoreError> {
        self.write_value(&state_dict.to_pickle(), writer)
    }

    /// Encode any value tree into memory.
    pub fn to_bytes(&self, value: &PickleValue) -> Result<Vec<u8>, StoreError> {
        Ok(self
            .write_value(value, Cursor::new(Vec::new()))?
            .into_inner())
    }
}

/// Encode a state dict into the bytes of a checkpoint archive.
pub fn encode_checkpoint(state_dict: &StateDict) -> Result<Vec<u8>, StoreError> {
    PytorchWriter::new().to_bytes(&state_dict.to_pickle())
}
