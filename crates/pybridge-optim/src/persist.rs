use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use pybridge_store::StoreError;
use pybridge_store::pytorch::{PytorchReader, PytorchWriter, TensorLoading};

use crate::{OptimStateError, OptimizerRecord, OptimizerState};

/// Encode optimizer state as a `torch.save` archive, loadable with
/// `optimizer.load_state_dict(torch.load(path))`.
pub fn save_optimizer<O, S>(optimizer: &OptimizerState<O, S>) -> Result<Vec<u8>, OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
{
    let value = optimizer.to_pickle()?;
    Ok(PytorchWriter::new().to_bytes(&value)?)
}

/// Load optimizer state from the bytes of a `torch.save(optimizer.state_dict(), ...)` archive.
pub fn load_optimizer<O, S>(
    bytes: &[u8],
    optimizer: &mut OptimizerState<O, S>,
) -> Result<(), OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
{
    let value = PytorchReader::from_bytes(bytes)?.read_value(TensorLoading::Eager)?;
    optimizer.load_pickle(&value)
}

/// Save optimizer state to `path`, naming the archive entries after the file stem as
/// `torch.save` does.
pub fn save_optimizer_file<O, S, P>(
    path: P,
    optimizer: &OptimizerState<O, S>,
) -> Result<(), OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let value = optimizer.to_pickle()?;
    let archive_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".into());

    log::debug!("Saving optimizer state to {}", path.display());
    let file = File::create(path).map_err(StoreError::from)?;
    let writer = PytorchWriter::new()
        .with_archive_name(archive_name)
        .write_value(&value, BufWriter::new(file))?;
    writer
        .into_inner()
        .map_err(|err| StoreError::from(err.into_error()))?;
    Ok(())
}

/// Load optimizer state from a file written by `torch.save`.
pub fn load_optimizer_file<O, S, P>(
    path: P,
    optimizer: &mut OptimizerState<O, S>,
) -> Result<(), OptimStateError>
where
    O: OptimizerRecord,
    S: OptimizerRecord,
    P: AsRef<Path>,
{
    let value = PytorchReader::from_file(path)?.read_value(TensorLoading::Eager)?;
    optimizer.load_pickle(&value)
}
