//! Lease based distributed lock serializing migrations across a cluster.
mod lease;
mod locker;
mod renewal;

pub use lease::*;
pub use locker::*;
