//! Host tensor model shared by every codec.

mod data;
mod dtype;
mod element;
mod scalar;

pub use data::*;
pub use dtype::*;
pub use element::*;
pub use scalar::*;
