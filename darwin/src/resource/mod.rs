//! Migration resources: how scripts are found and what role each one plays.
mod classifier;
mod provider;

pub use classifier::*;
pub use provider::*;
