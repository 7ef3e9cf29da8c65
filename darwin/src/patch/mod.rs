//! Patches and their statements.
mod catalog;
mod model;

pub use catalog::*;
pub use model::*;
