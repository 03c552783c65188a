//! Scoped access to the entries of a zip checkpoint container.
//!
//! Readers share one open archive between all entry handles; each handle reads its entry
//! independently of the position of the others. Writers store every entry uncompressed with a
//! fixed timestamp so identical inputs produce identical archives.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::StoreError;

/// Signature of a zip local file header.
pub const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// A seekable byte source.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Fail with [`StoreError::LegacyFormat`] unless the source starts with a zip header.
///
/// The source is rewound to where it was.
pub fn check_signature<R: Read + Seek>(reader: &mut R) -> Result<(), StoreError> {
    let start = reader.stream_position()?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = reader.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    reader.seek(SeekFrom::Start(start))?;

    if filled < magic.len() || magic != ZIP_SIGNATURE {
        return Err(StoreError::LegacyFormat);
    }
    Ok(())
}

/// Read side of a checkpoint archive.
#[derive(Clone)]
pub struct ArchiveReader {
    archive: Rc<RefCell<ZipArchive<Box<dyn ReadSeek>>>>,
    names: Rc<Vec<String>>,
}

impl ArchiveReader {
    /// Open an archive after checking its signature.
    pub fn new<R: Read + Seek + 'static>(mut reader: R) -> Result<Self, StoreError> {
        check_signature(&mut reader)?;
        let archive = ZipArchive::new(Box::new(reader) as Box<dyn ReadSeek>)?;
        let names = archive.file_names().map(ToString::to_string).collect::<Vec<_>>();
        log::debug!("Opened checkpoint archive with {} entries", names.len());

        Ok(Self {
            archive: Rc::new(RefCell::new(archive)),
            names: Rc::new(names),
        })
    }

    /// Entry names in archive order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Handle to the single entry whose name ends with `data.pkl`.
    pub fn pickle_entry(&self) -> Result<ArchiveEntry, StoreError> {
        let mut found = self
            .names
            .iter()
            .enumerate()
            .filter(|(_, name)| name.ends_with("data.pkl"));

        match (found.next(), found.next()) {
            (Some((index, name)), None) => Ok(self.handle(index, name)),
            (None, _) => Err(StoreError::Format(
                "archive does not contain a data.pkl entry".into(),
            )),
            (Some(_), Some(_)) => Err(StoreError::Format(
                "archive contains more than one data.pkl entry".into(),
            )),
        }
    }

    /// Handle to the storage entry of `key`, named `.../data/<key>`.
    pub fn storage_entry(&self, key: &str) -> Result<ArchiveEntry, StoreError> {
        let exact = format!("data/{key}");
        let nested = format!("/data/{key}");
        self.names
            .iter()
            .position(|name| *name == exact || name.ends_with(&nested))
            .map(|index| self.handle(index, &self.names[index]))
            .ok_or_else(|| StoreError::Format(format!("archive has no entry for storage `{key}`")))
    }

    fn handle(&self, index: usize, name: &str) -> ArchiveEntry {
        ArchiveEntry {
            archive: self.archive.clone(),
            index,
            name: name.to_string(),
        }
    }
}

/// Position independent handle to one archive entry.
#[derive(Clone)]
pub struct ArchiveEntry {
    archive: Rc<RefCell<ZipArchive<Box<dyn ReadSeek>>>>,
    index: usize,
    name: String,
}

impl ArchiveEntry {
    /// Full entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the whole entry.
    pub fn read(&self) -> Result<Vec<u8>, StoreError> {
        let mut archive = self.archive.borrow_mut();
        let mut file = archive.by_index(self.index)?;
        let mut bytes = Vec::with_capacity(initial_capacity(file.size()));
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Largest buffer reserved up front from an entry's declared size; past it the buffer grows
/// with the bytes actually read.
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared)
        .unwrap_or(MAX_PREALLOCATION)
        .min(MAX_PREALLOCATION)
}

impl std::fmt::Debug for ArchiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

/// Write side of a checkpoint archive.
///
/// Entry names are prefixed with the archive name, e.g. `archive/data.pkl`.
pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    prefix: String,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Start a new archive.
    pub fn new(writer: W, archive_name: &str) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            prefix: archive_name.to_string(),
        }
    }

    /// Add an uncompressed entry named `<archive>/<name>`.
    pub fn write_entry(&mut self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default())
            .large_file(bytes.len() as u64 >= u32::MAX as u64);

        self.zip
            .start_file(format!("{}/{}", self.prefix, name), options)?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    /// Write the central directory and return the underlying writer.
    pub fn finish(self) -> Result<W, StoreError> {
        Ok(self.zip.finish()?)
    }
}
