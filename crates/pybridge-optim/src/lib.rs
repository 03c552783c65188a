#![warn(missing_docs)]

//! # Pybridge Optim
//!
//! Typed optimizer state that saves to, and loads from, the `optimizer.state_dict()` layout
//! PyTorch pickles:
//!
//! ```text
//! {"state": {0: {"step": tensor(3), "exp_avg": ..., ...}, ...},
//!  "param_groups": [{"lr": 0.001, "betas": (0.9, 0.999), ..., "params": [0, 1]}, ...]}
//! ```
//!
//! Every optimizer kind is described by a closed field table ([`OptimizerRecord::FIELDS`]) that
//! says how each typed field is packed into the generic structure.
//!
//! ```rust
//! use pybridge_optim::optim::{Adam, AdamOptions};
//! use pybridge_optim::{ParamGroup, load_optimizer, save_optimizer};
//!
//! let options = AdamOptions {
//!     lr: 0.01,
//!     beta2: 0.99,
//!     ..Default::default()
//! };
//! let adam = Adam::from_groups(vec![ParamGroup::new(options, vec![0, 1])]);
//! let bytes = save_optimizer(&adam)?;
//!
//! let mut restored = Adam::from_groups(vec![ParamGroup::new(AdamOptions::default(), vec![0, 1])]);
//! load_optimizer(&bytes, &mut restored)?;
//! assert_eq!(restored.param_groups[0].options.beta2, 0.99);
//! # Ok::<(), pybridge_optim::OptimStateError>(())
//! ```

mod error;
mod persist;
mod record;
mod transcoder;

/// Field tables for the optimizers PyTorch ships.
pub mod optim;

pub use error::OptimStateError;
pub use persist::{load_optimizer, load_optimizer_file, save_optimizer, save_optimizer_file};
pub use record::{Field, FieldSpec, FieldType, FieldValue, OptimizerRecord, Packing};
pub use transcoder::{OptimizerState, ParamGroup, load_optimizer_state, save_optimizer_state};
