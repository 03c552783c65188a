//! Plumbing shared by the file and in-memory stores.

use std::path::PathBuf;

use crate::{ApplyOptions, KeyFilter, StoreError};

/// Where a store reads from and writes to.
#[derive(Debug, Clone)]
pub(crate) enum StoreMode {
    File(PathBuf),
    Bytes(Option<Vec<u8>>),
}

impl StoreMode {
    /// Bytes to decode: the file contents or the in-memory buffer.
    pub(crate) fn read(&self) -> Result<Vec<u8>, StoreError> {
        match self {
            StoreMode::File(path) => Ok(std::fs::read(path)?),
            StoreMode::Bytes(Some(bytes)) => Ok(bytes.clone()),
            StoreMode::Bytes(None) => Err(StoreError::Format("no bytes to read from".into())),
        }
    }

    /// Persist an encoded checkpoint.
    pub(crate) fn write(&mut self, bytes: Vec<u8>, overwrite: bool) -> Result<(), StoreError> {
        match self {
            StoreMode::File(path) => {
                if path.exists() && !overwrite {
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!(
                            "File already exists: {}. Use .overwrite(true) to overwrite.",
                            path.display()
                        ),
                    )));
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(path, bytes)?;
            }
            StoreMode::Bytes(slot) => *slot = Some(bytes),
        }
        Ok(())
    }

    /// The in-memory buffer, after a save or as given at construction.
    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        match self {
            StoreMode::Bytes(Some(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

/// Apply options with every key rejected by the filter added to the skip list.
pub(crate) fn filtered_options<'a>(
    options: &ApplyOptions,
    filter: Option<&KeyFilter>,
    names: impl IntoIterator<Item = &'a str>,
) -> ApplyOptions {
    let mut options = options.clone();
    if let Some(filter) = filter {
        let rejected: Vec<String> = names
            .into_iter()
            .filter(|name| !filter.matches(name) && !options.skip.iter().any(|s| s == name))
            .map(String::from)
            .collect();
        options.skip.extend(rejected);
    }
    options
}
