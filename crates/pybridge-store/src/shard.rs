//! Sharded checkpoints and checkpoint directories as written by `save_pretrained`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::applier::{ApplyError, apply_state_dict, plan_keys};
use crate::pytorch::{PytorchReader, PytorchStore};
use crate::safetensors::{SafetensorsReader, SafetensorsStore};
use crate::{ApplyOptions, ApplyResult, KeyFilter, ModuleSnapshot, ModuleStore, StateDict, StoreError};

/// File names probed in a checkpoint directory, in order.
pub const CHECKPOINT_NAMES: [&str; 4] = [
    "model.safetensors",
    "model.safetensors.index.json",
    "pytorch_model.bin",
    "pytorch_model.bin.index.json",
];

/// Index of a sharded checkpoint: `{"weight_map": {<tensor>: <shard file>}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardIndex {
    /// Free-form index metadata such as `total_size`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Shard file of every tensor.
    pub weight_map: BTreeMap<String, String>,
}

impl ShardIndex {
    /// Parse an index from JSON text.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read an index file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Tensor names, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.weight_map.keys().map(String::as_str)
    }

    /// Drop keys from the weight map.
    pub fn remove_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            self.weight_map.remove(key);
        }
    }

    /// Tensor names grouped by shard file, both sorted.
    pub fn shards(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut shards: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (key, file) in self.weight_map.iter() {
            shards.entry(file.as_str()).or_default().push(key.as_str());
        }
        shards
    }
}

/// Load a sharded checkpoint into `module`.
///
/// Key matching is done once against the whole weight map; in strict mode a mismatch fails
/// before any shard is opened. Shards holding no tensor the module takes are never opened.
/// `open_shard` receives a shard file name and the filter of the tensors wanted from it.
pub fn load_sharded<M, F>(
    index: &ShardIndex,
    module: &mut M,
    options: &ApplyOptions,
    mut open_shard: F,
) -> Result<ApplyResult, StoreError>
where
    M: ModuleSnapshot + ?Sized,
    F: FnMut(&str, &KeyFilter) -> Result<StateDict, StoreError>,
{
    let plan = {
        let target = module.state_dict();
        plan_keys(target.names(), index.keys(), options)?
    };

    let mut shards: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for key in plan.load.iter() {
        if let Some(file) = index.weight_map.get(key) {
            shards.entry(file.as_str()).or_default().push(key.as_str());
        }
    }

    let partial = options.clone().with_strict(false);
    let total = shards.len();
    let mut result = ApplyResult::default();
    for (position, (file, keys)) in shards.into_iter().enumerate() {
        log::info!("Loading shard {}/{total}: {file}", position + 1);
        let filter = KeyFilter::new().with_keys(keys);
        let mut loaded = open_shard(file, &filter)?;
        loaded.retain(|name| filter.matches(name));
        let applied = apply_state_dict(module, loaded, &partial)?;
        result.applied.extend(applied.applied);
    }

    let absent: Vec<String> = plan
        .load
        .iter()
        .filter(|key| !result.applied.contains(key))
        .cloned()
        .collect();
    if !absent.is_empty() {
        if options.strict {
            return Err(ApplyError::KeyMismatch {
                missing: absent,
                unexpected: Vec::new(),
            }
            .into());
        }
        log::warn!("{} indexed tensors were not found in their shards", absent.len());
    }

    result.skipped = plan.skipped;
    result.missing = plan.missing;
    result.missing.extend(absent);
    Ok(result)
}

/// A checkpoint located in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    /// A single safetensors file.
    Safetensors(PathBuf),
    /// A single `torch.save` archive.
    Pytorch(PathBuf),
    /// A shard index; shard files live next to it.
    Sharded(PathBuf),
}

impl Checkpoint {
    fn from_path(path: PathBuf) -> Self {
        let name = path.to_string_lossy().into_owned();
        if name.ends_with(".safetensors") {
            Checkpoint::Safetensors(path)
        } else if name.ends_with(".json") {
            Checkpoint::Sharded(path)
        } else {
            Checkpoint::Pytorch(path)
        }
    }

    /// Load the checkpoint into `module`.
    pub fn load_into<M: ModuleSnapshot + ?Sized>(
        &self,
        module: &mut M,
        options: &ApplyOptions,
    ) -> Result<ApplyResult, StoreError> {
        match self {
            Checkpoint::Safetensors(path) => SafetensorsStore::from_file(path)
                .options(options.clone())
                .apply_to(module),
            Checkpoint::Pytorch(path) => PytorchStore::from_file(path)
                .options(options.clone())
                .apply_to(module),
            Checkpoint::Sharded(path) => {
                let index = ShardIndex::from_file(path)?;
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                load_sharded(&index, module, options, |file, filter| {
                    read_shard(&dir.join(file), filter)
                })
            }
        }
    }
}

/// Read the selected tensors of one shard file, by extension.
pub fn read_shard(path: &Path, filter: &KeyFilter) -> Result<StateDict, StoreError> {
    if path.to_string_lossy().ends_with(".safetensors") {
        SafetensorsReader::from_file(path)?.read_filtered(|name| filter.matches(name))
    } else {
        let mut state_dict = PytorchReader::from_file(path)?.read_state_dict()?;
        state_dict.retain(|name| filter.matches(name));
        Ok(state_dict)
    }
}

/// A directory holding a checkpoint saved the way `save_pretrained` saves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    /// Wrap a directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Locate the checkpoint.
    ///
    /// Without a name, [`CHECKPOINT_NAMES`] are probed in order. A given name must be a bare
    /// file name; point it at the `.index.json` file for sharded checkpoints.
    pub fn resolve(&self, name: Option<&str>) -> Result<Checkpoint, StoreError> {
        if !self.dir.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint directory {} does not exist", self.dir.display()),
            )));
        }

        match name {
            Some(name) => {
                if name.contains('/') || name.contains('\\') {
                    return Err(StoreError::Format(format!(
                        "checkpoint name `{name}` must be a file name, not a path"
                    )));
                }
                Ok(Checkpoint::from_path(self.dir.join(name)))
            }
            None => CHECKPOINT_NAMES
                .iter()
                .map(|name| self.dir.join(name))
                .find(|path| path.is_file())
                .map(Checkpoint::from_path)
                .ok_or_else(|| {
                    StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!(
                            "no checkpoint found in {}, expected one of {CHECKPOINT_NAMES:?}",
                            self.dir.display()
                        ),
                    ))
                }),
        }
    }

    /// Locate and load the checkpoint into `module`.
    pub fn load_into<M: ModuleSnapshot + ?Sized>(
        &self,
        module: &mut M,
        name: Option<&str>,
        options: &ApplyOptions,
    ) -> Result<ApplyResult, StoreError> {
        self.resolve(name)?.load_into(module, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pytorch::encode_checkpoint;
    use crate::safetensors::encode_safetensors;
    use crate::tensor::{DType, TensorData};

    fn module() -> StateDict {
        [
            ("a", TensorData::zeros(DType::F32, [2])),
            ("b", TensorData::zeros(DType::F32, [2])),
            ("c", TensorData::zeros(DType::F32, [2])),
        ]
        .into_iter()
        .collect()
    }

    fn shard(names: &[&str], value: f32) -> StateDict {
        names
            .iter()
            .map(|name| (*name, TensorData::full(value, [2])))
            .collect()
    }

    fn write_sharded(dir: &Path) {
        std::fs::write(
            dir.join("model-00001-of-00002.safetensors"),
            encode_safetensors(&shard(&["a", "b"], 1.0)).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("model-00002-of-00002.safetensors"),
            encode_safetensors(&shard(&["c", "d"], 2.0)).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{
                "metadata": {"total_size": 32},
                "weight_map": {
                    "a": "model-00001-of-00002.safetensors",
                    "b": "model-00001-of-00002.safetensors",
                    "c": "model-00002-of-00002.safetensors",
                    "d": "model-00002-of-00002.safetensors"
                }
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn index_groups_keys_by_shard() {
        let index = ShardIndex::from_json(
            r#"{"weight_map": {"x": "s2", "a": "s1", "b": "s2"}}"#,
        )
        .unwrap();
        let shards = index.shards();

        assert_eq!(shards.get("s1").unwrap(), &vec!["a"]);
        assert_eq!(shards.get("s2").unwrap(), &vec!["b", "x"]);
        assert!(index.metadata.is_empty());
    }

    #[test]
    fn malformed_index_is_a_json_error() {
        assert!(matches!(
            ShardIndex::from_json(r#"{"shards": []}"#),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn unneeded_shards_are_never_opened() {
        let index = ShardIndex::from_json(
            r#"{"weight_map": {"a": "one", "b": "one", "c": "two", "z": "three"}}"#,
        )
        .unwrap();
        let mut model = module();
        let mut opened = Vec::new();

        let options = ApplyOptions::new().with_strict(false);
        let result = load_sharded(&index, &mut model, &options, |file, _| {
            opened.push(file.to_string());
            Ok(match file {
                "one" => shard(&["a", "b"], 1.0),
                _ => shard(&["c"], 2.0),
            })
        })
        .unwrap();

        assert_eq!(opened, vec!["one", "two"]);
        assert_eq!(result.applied, vec!["a", "b", "c"]);
        assert_eq!(result.skipped, vec!["z"]);
        assert_eq!(model.get("c").unwrap().to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn strict_mismatch_fails_before_opening_shards() {
        let index = ShardIndex::from_json(r#"{"weight_map": {"a": "one"}}"#).unwrap();
        let mut model = module();

        let err = load_sharded(&index, &mut model, &ApplyOptions::default(), |_, _| {
            panic!("no shard should be opened")
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Apply(ApplyError::KeyMismatch { .. })));
    }

    #[test]
    fn directory_probe_prefers_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pytorch_model.bin"),
            encode_checkpoint(&shard(&["a"], 1.0)).unwrap(),
        )
        .unwrap();
        let checkpoint_dir = CheckpointDir::new(dir.path());
        assert_eq!(
            checkpoint_dir.resolve(None).unwrap(),
            Checkpoint::Pytorch(dir.path().join("pytorch_model.bin"))
        );

        write_sharded(dir.path());
        assert_eq!(
            checkpoint_dir.resolve(None).unwrap(),
            Checkpoint::Sharded(dir.path().join("model.safetensors.index.json"))
        );
        assert!(matches!(
            checkpoint_dir.resolve(Some("sub/model.bin")),
            Err(StoreError::Format(_))
        ));
    }

    #[test]
    fn sharded_directory_loads_non_strict() {
        let dir = tempfile::tempdir().unwrap();
        write_sharded(dir.path());
        let mut model = module();

        let options = ApplyOptions::new().with_strict(false).with_skip(["b"]);
        let result = CheckpointDir::new(dir.path())
            .load_into(&mut model, None, &options)
            .unwrap();

        assert_eq!(result.applied, vec!["a", "c"]);
        let loaded = result.loaded_parameters();
        assert_eq!(loaded.get("d"), Some(&false));
        assert_eq!(loaded.get("b"), Some(&false));
        assert_eq!(model.get("a").unwrap().to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(model.get("b").unwrap().to_vec::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn empty_directory_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CheckpointDir::new(dir.path()).resolve(None),
            Err(StoreError::Io(_))
        ));
    }
}
