//! PyTorch zip checkpoint support: the pickle virtual machine, storage resolution, tensor
//! rebuilding and the matching encoder.

mod pickle_reader;
mod pickle_writer;
mod reader;
mod rebuild;
mod storage;
mod store;
mod value;
mod writer;

pub use pickle_reader::{OpCode, PickleError, read_pickle, read_pickle_with};
pub use pickle_writer::{EncodedPickle, write_pickle};
pub use reader::{PytorchReader, decode_checkpoint};
pub use rebuild::{DeferredTensor, TensorDescriptor};
pub use storage::{PersistentLoad, StorageRecord, StorageResolver, TensorLoading};
pub use store::PytorchStore;
pub use value::{DictKey, PickleDict, PickleValue, TensorRef};
pub use writer::{PytorchWriter, encode_checkpoint};

#[cfg(test)]
mod tests;
