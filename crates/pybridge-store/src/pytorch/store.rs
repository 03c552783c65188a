use std::path::Path;

use super::reader::PytorchReader;
use super::writer::PytorchWriter;
use crate::applier::apply_state_dict;
use crate::store::{StoreMode, filtered_options};
use crate::{ApplyOptions, ApplyResult, KeyFilter, ModuleSnapshot, ModuleStore, StoreError};

/// Store for `torch.save` zip checkpoints (`.pt`, `.pth`, `pytorch_model.bin`).
///
/// # Example
///
/// ```rust,no_run
/// use pybridge_store::{ModuleSnapshot, PytorchStore, StateDict};
///
/// let mut model: StateDict = StateDict::new();
/// let mut store = PytorchStore::from_file("pytorch_model.bin").strict(false);
/// let result = model.load_from(&mut store)?;
/// println!("{result}");
/// # Ok::<(), pybridge_store::StoreError>(())
/// ```
pub struct PytorchStore {
    mode: StoreMode,
    filter: Option<KeyFilter>,
    options: ApplyOptions,
    overwrite: bool,
    archive_name: Option<String>,
}

impl PytorchStore {
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
            overwrite: false,
            archive_name: None,
        }
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

    /// Entry prefix inside the archive, `torch.save` uses the file stem.
    ///
    /// Default: `archive`
    pub fn archive_name(mut self, name: impl Into<String>) -> Self {
        self.archive_name = Some(name.into());
        self
    }

    /// The checkpoint bytes, after saving to or when reading from memory.
    pub fn get_bytes(&self) -> Option<&[u8]> {
        self.mode.bytes()
    }

    fn writer(&self) -> PytorchWriter {
        match &self.archive_name {
            Some(name) => PytorchWriter::new().with_archive_name(name.clone()),
            None => PytorchWriter::new(),
        }
    }
}

impl ModuleStore for PytorchStore {
    type Error = StoreError;

    fn collect_from<M: ModuleSnapshot + ?Sized>(&mut self, module: &M) -> Result<(), Self::Error> {
        let mut state_dict = module.state_dict();
        if let Some(filter) = &self.filter {
            state_dict.retain(|name| filter.matches(name));
        }
        let bytes = self.writer().to_bytes(&state_dict.to_pickle())?;
        self.mode.write(bytes, self.overwrite)
    }

    fn apply_to<M: ModuleSnapshot + ?Sized>(
        &mut self,
        module: &mut M,
    ) -> Result<ApplyResult, Self::Error> {
        let reader = match &self.mode {
            StoreMode::File(path) => PytorchReader::from_file(path)?,
            mode => PytorchReader::from_bytes(mode.read()?)?,
        };
        let loaded = reader.read_state_dict()?;

        let target = module.state_dict();
        let options = filtered_options(
            &self.options,
            self.filter.as_ref(),
            target.names().chain(loaded.names()),
        );
        Ok(apply_state_dict(module, loaded, &options)?)
    }
}
