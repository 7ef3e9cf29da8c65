use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State of a named lock as seen by the database clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lease row exists.
    Available,
    /// A lease row exists and has not expired.
    Leased,
    /// A lease row exists but its holder stopped renewing it.
    LeasedExpired,
}

impl Display for LockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Available => write!(f, "available"),
            LockState::Leased => write!(f, "leased"),
            LockState::LeasedExpired => write!(f, "leased (expired)"),
        }
    }
}

/// Result of a lease attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease was granted; the key is needed to renew or release it.
    Acquired(String),
    /// Someone else holds a valid lease.
    Locked,
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            LeaseOutcome::Acquired(key) => Some(key),
            LeaseOutcome::Locked => None,
        }
    }

    /// Unlock key of an acquired lease; a [`ErrorKind::LockContention`] error
    /// naming `process` otherwise.
    pub fn into_key(self, process: &str) -> DarwinResult<String> {
        match self {
            LeaseOutcome::Acquired(key) => Ok(key),
            LeaseOutcome::Locked => Err(DarwinError::new(
                &format!("Lock {} is held by another process", process),
                ErrorKind::LockContention,
            )),
        }
    }
}

/// Tells the auto-renewal whether the work protected by a lease is done.
pub trait LockRestorer: Send + Sync {
    fn is_finished(&self) -> bool;
}

impl<F> LockRestorer for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_finished(&self) -> bool {
        self()
    }
}

/// A [`LockRestorer`] flipped to finished by hand.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag {
    finished: Arc<AtomicBool>,
}

impl CompletionFlag {
    pub fn new() -> CompletionFlag {
        CompletionFlag::default()
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl LockRestorer for CompletionFlag {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
