#![warn(missing_docs)]

//! # Pybridge Store
//!
//! Read and write PyTorch checkpoints without Python.
//!
//! - `torch.save` zip archives: a pickle decoder for the subset of the protocol tensor
//!   checkpoints use, storage resolution against the archive entries, strided tensor
//!   rebuilding, and an encoder producing archives `torch.load` accepts.
//! - safetensors files, with partial reads driven by the header index.
//! - Loading a state dict into a module with `load_state_dict` semantics: strict or non-strict
//!   key matching, skip lists, shape checks.
//! - Sharded checkpoints and `save_pretrained` directories.
//!
//! ```rust
//! use pybridge_store::pytorch::{decode_checkpoint, encode_checkpoint};
//! use pybridge_store::{StateDict, TensorData};
//!
//! let state_dict: StateDict = [("linear.weight", TensorData::full(0.5f32, [4, 2]))]
//!     .into_iter()
//!     .collect();
//!
//! let bytes = encode_checkpoint(&state_dict)?;
//! assert_eq!(decode_checkpoint(&bytes)?, state_dict);
//! # Ok::<(), pybridge_store::StoreError>(())
//! ```

mod applier;
mod archive;
mod collections;
mod error;
mod filter;
mod shard;
mod state_dict;
mod store;
mod traits;

/// Zip container access shared by the PyTorch reader and writer.
pub mod container {
    pub use crate::archive::{
        ArchiveEntry, ArchiveReader, ArchiveWriter, ReadSeek, ZIP_SIGNATURE, check_signature,
    };
}

/// PyTorch zip checkpoints.
pub mod pytorch;

/// Safetensors files.
pub mod safetensors;

/// Tensor data model.
pub mod tensor;

pub use applier::{ApplyError, ApplyOptions, ApplyResult, apply_state_dict};
pub use collections::OrderedMap;
pub use error::StoreError;
pub use filter::KeyFilter;
pub use pytorch::PytorchStore;
pub use safetensors::SafetensorsStore;
pub use shard::{
    CHECKPOINT_NAMES, Checkpoint, CheckpointDir, ShardIndex, load_sharded, read_shard,
};
pub use state_dict::StateDict;
pub use tensor::*;
pub use traits::{ModuleSnapshot, ModuleStore};
