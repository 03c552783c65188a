use std::collections::BTreeMap;
use std::io::{Read, Seek};
use std::path::Path;

use hashbrown::HashSet;

use super::reader::SafetensorsReader;
use super::writer::encode_safetensors_with_metadata;
use crate::applier::{apply_state_dict, plan_keys};
use crate::store::{StoreMode, filtered_options};
use crate::{ApplyOptions, ApplyResult, KeyFilter, ModuleSnapshot, ModuleStore, StoreError};

/// Store for safetensors files.
///
/// Loading reads the header first, checks the keys against the module and then reads only the
/// byte ranges of the tensors the module will take.
pub struct SafetensorsStore {
    mode: StoreMode,
    filter: Option<KeyFilter>,
    options: ApplyOptions,
    metadata: BTreeMap<String, String>,
    overwrite: bool,
}

impl SafetensorsStore {
    /// Metadata written to every file: `format` is `pt`, as PyTorch tooling expects.
    pub fn default_metadata() -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("format".into(), "pt".into());
        metadata
    }

    /// Create a store backed by a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        Self::with_mode(StoreMode::File(path.as_ref().to_path_buf()))
    }

    /// Create a store from bytes (for reading) or empty (for writing).
    pub fn from_bytes(bytes: Option<Vec<u8>>) -> Self {
        Self::with_mode(StoreMode::Bytes(bytes))
    }

    fn with_mode(mode: StoreMode) -> Self {
        Self {
            mode,
            filter: None,
            options: ApplyOptions::default(),
            metadata: Self::default_metadata(),
            overwrite: false,
        }
    }

    /// Add metadata key-value pair
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Clear all metadata, including the defaults.
    pub fn clear_metadata(mut self) -> Self {
        self.metadata.clear();
        self
    }

    /// Require checkpoint and module keys to match exactly.
    ///
    /// Default: `true`
    pub fn strict(mut self, strict: bool) -> Self {
        self.options.strict = strict;
        self
    }

    /// Ignore these keys on both sides when loading.
    pub fn skip<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_skip(keys);
        self
    }

    /// Replace all apply options.
    pub fn options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Only save and load tensors selected by the filter.
    pub fn with_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Allow overwriting existing files when saving.
    ///
    /// Default: `false`
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// The file bytes, after saving to or when reading from memory.
    pub fn get_bytes(&self) -> Option<&[u8]> {
        self.mode.bytes()
    }

    fn apply_from_reader<R: Read + Seek, M: ModuleSnapshot + ?Sized>(
        &self,
        mut reader: SafetensorsReader<R>,
        module: &mut M,
    ) -> Result<ApplyResult, StoreError> {
        let target = module.state_dict();
        let options = filtered_options(
            &self.options,
            self.filter.as_ref(),
            target.names().chain(reader.names()),
        );
        let plan = plan_keys(target.names(), reader.names(), &options)?;

        let wanted: HashSet<&str> = plan.load.iter().map(String::as_str).collect();
        let loaded = reader.read_filtered(|name| wanted.contains(name))?;

        let mut result = apply_state_dict(module, loaded, &options.with_strict(false))?;
        result.skipped = plan.skipped;
        result.missing = plan.missing;
        Ok(result)
    }
}

impl ModuleStore for SafetensorsStore {
    type Error = StoreError;

    fn collect_from<M: ModuleSnapshot + ?Sized>(&mut self, module: &M) -> Result<(), Self::Error> {
        let mut state_dict = module.state_dict();
        if let Some(filter) = &self.filter {
            state_dict.retain(|name| filter.matches(name));
        }
        let metadata = (!self.metadata.is_empty()).then_some(&self.metadata);
        let bytes = encode_safetensors_with_metadata(&state_dict, metadata)?;
        self.mode.write(bytes, self.overwrite)
    }

    fn apply_to<M: ModuleSnapshot + ?Sized>(
        &mut self,
        module: &mut M,
    ) -> Result<ApplyResult, Self::Error> {
        match &self.mode {
            StoreMode::File(path) => {
                let reader = SafetensorsReader::from_file(path)?;
                self.apply_from_reader(reader, module)
            }
            mode => {
                let reader = SafetensorsReader::from_bytes(mode.read()?)?;
                self.apply_from_reader(reader, module)
            }
        }
    }
}
