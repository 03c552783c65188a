use crate::applier::{ApplyError, ApplyOptions, ApplyResult, apply_state_dict};
use crate::tensor::TensorData;
use crate::StateDict;

/// A module whose parameters and buffers can be snapshotted and restored by name.
///
/// Implementors expose their tensors as a [`StateDict`] and accept tensors back one name at a
/// time. Name matching, skip lists and shape checks are handled by [`apply_state_dict`], so an
/// implementation only has to store what it is given, converting the element type if it keeps
/// tensors in another precision.
pub trait ModuleSnapshot {
    /// Snapshot of every tensor, in registration order.
    fn state_dict(&self) -> StateDict;

    /// Replace the tensor of that name.
    ///
    /// Only called for names present in [`ModuleSnapshot::state_dict`] and with a matching shape.
    fn load_tensor(&mut self, name: &str, tensor: TensorData) -> Result<(), ApplyError>;

    /// Load a state dict with the given options.
    fn load_state_dict(
        &mut self,
        state_dict: StateDict,
        options: &ApplyOptions,
    ) -> Result<ApplyResult, ApplyError> {
        apply_state_dict(self, state_dict, options)
    }

    /// Save the module through a [`ModuleStore`].
    ///
    /// # Arguments
    ///
    /// * `store` - A mutable reference to a [`ModuleStore`] that will write the tensors
    fn save_into<S>(&self, store: &mut S) -> Result<(), S::Error>
    where
        S: ModuleStore,
        Self: Sized,
    {
        store.collect_from(self)
    }

    /// Load the module from a [`ModuleStore`].
    ///
    /// # Arguments
    ///
    /// * `store` - A mutable reference to a [`ModuleStore`] that will read and apply tensors
    fn load_from<S>(&mut self, store: &mut S) -> Result<ApplyResult, S::Error>
    where
        S: ModuleStore,
        Self: Sized,
    {
        store.apply_to(self)
    }
}

/// A checkpoint format able to save and load modules.
pub trait ModuleStore {
    /// The error type that can be returned during storage operations.
    type Error: std::fmt::Debug + std::fmt::Display;

    /// Collect the tensors of a module and write them to storage.
    fn collect_from<M: ModuleSnapshot + ?Sized>(&mut self, module: &M) -> Result<(), Self::Error>;

    /// Read stored tensors and apply them to a module.
    ///
    /// # Returns
    ///
    /// * `Ok(ApplyResult)` - Which checkpoint tensors were loaded, skipped, or missing
    /// * `Err(Self::Error)` - If reading failed or the load was rejected
    fn apply_to<M: ModuleSnapshot + ?Sized>(
        &mut self,
        module: &mut M,
    ) -> Result<ApplyResult, Self::Error>;
}

impl ModuleSnapshot for StateDict {
    fn state_dict(&self) -> StateDict {
        self.clone()
    }

    fn load_tensor(&mut self, name: &str, tensor: TensorData) -> Result<(), ApplyError> {
        match self.get_mut(name) {
            Some(slot) => {
                *slot = tensor;
                Ok(())
            }
            None => Err(ApplyError::LoadError {
                name: name.into(),
                message: "no tensor of that name".into(),
            }),
        }
    }
}
