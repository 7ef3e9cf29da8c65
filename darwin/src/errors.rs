use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

use crate::common::{atomic, Atomic};

/// Error kinds for Darwin operations
///
/// Each kind names one category of failure so callers can decide whether a
/// failure is recoverable (lock contention), a coordination bug (lock integrity),
/// bad resource metadata (patch/statement format) or a failing SQL statement.
///
/// # Examples
///
/// ```rust,ignore
/// use darwin::errors::{DarwinError, ErrorKind, DarwinResult};
///
/// fn example() -> DarwinResult<()> {
///     Err(DarwinError::new("Lock is held by another process", ErrorKind::LockContention))
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // Lock Errors
    /// Another process holds a valid lease on the lock
    LockContention,
    /// Renew or release was called with a key that does not match the lock row
    LockIntegrity,

    // Resource Metadata Errors
    /// Malformed patch metadata (name, version, platform, component)
    PatchFormat,
    /// Malformed script contents (unterminated string or comment)
    StatementFormat,

    // Execution Errors
    /// A SQL statement of a patch failed to execute
    ExecutionError,

    // Database Errors
    /// The database cannot be reached or its platform cannot be determined
    ConnectivityError,
    /// Error reported by the database driver
    BackendError,

    // Operation Errors
    /// The operation is not valid in the current context
    InvalidOperation,
    /// The requested resource or component was not found
    NotFound,

    // IO Errors
    /// Generic IO error
    IOError,

    // Generic/Internal Errors - used as fallback
    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::LockContention => write!(f, "Lock contention"),
            ErrorKind::LockIntegrity => write!(f, "Lock integrity violation"),
            ErrorKind::PatchFormat => write!(f, "Patch format error"),
            ErrorKind::StatementFormat => write!(f, "Statement format error"),
            ErrorKind::ExecutionError => write!(f, "Execution error"),
            ErrorKind::ConnectivityError => write!(f, "Connectivity error"),
            ErrorKind::BackendError => write!(f, "Backend error"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Custom Darwin error type.
///
/// `DarwinError` encapsulates the error message, its kind and an optional cause.
/// It supports error chaining and keeps the backtrace of the place it was created.
///
/// # Examples
///
/// ```rust,ignore
/// use darwin::errors::{DarwinError, ErrorKind};
///
/// let cause = DarwinError::new("no such table: t", ErrorKind::BackendError);
/// let err = DarwinError::new_with_cause("Statement failed", ErrorKind::ExecutionError, cause);
/// ```
#[derive(Clone)]
pub struct DarwinError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<DarwinError>>,
    backtrace: Atomic<Backtrace>,
}

impl DarwinError {
    /// Creates a new `DarwinError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        DarwinError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a new `DarwinError` with a cause error.
    ///
    /// The cause is preserved and reported through [`Error::source`].
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: DarwinError) -> Self {
        DarwinError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: atomic(Backtrace::new()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&DarwinError> {
        self.cause.as_deref()
    }

    /// Walks the cause chain and returns the innermost error.
    pub fn root_cause(&self) -> &DarwinError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

impl Display for DarwinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for DarwinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace.read()),
        }
    }
}

impl Error for DarwinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for Darwin operations.
pub type DarwinResult<T> = Result<T, DarwinError>;

impl From<std::io::Error> for DarwinError {
    fn from(err: std::io::Error) -> Self {
        let error_kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::IOError,
        };
        DarwinError::new(&format!("IO error: {}", err), error_kind)
    }
}

impl From<rusqlite::Error> for DarwinError {
    fn from(err: rusqlite::Error) -> Self {
        DarwinError::new(&format!("Database error: {}", err), ErrorKind::BackendError)
    }
}

impl From<std::fmt::Error> for DarwinError {
    fn from(err: std::fmt::Error) -> Self {
        DarwinError::new(
            &format!("Formatting error: {}", err),
            ErrorKind::InternalError,
        )
    }
}

impl From<String> for DarwinError {
    fn from(msg: String) -> Self {
        DarwinError::new(&msg, ErrorKind::InternalError)
    }
}

impl From<&str> for DarwinError {
    fn from(msg: &str) -> Self {
        DarwinError::new(msg, ErrorKind::InternalError)
    }
}
