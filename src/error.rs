// Crate-wide error type.
//
// Flat, many-variant shape: each failure category carries its own
// contextual string rather than a nested cause tree, matching how
// boundaries in this codebase describe what failed in the message itself.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AccessError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Buffer flushing failed: {0}")]
    BufferFlushing(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// A primary-path failure that was compounded by a secondary failure
    /// while attempting the fallback (e.g. primary persister down *and*
    /// the backup write also failed).
    #[error("{primary} (secondary failure while handling: {secondary})")]
    AggregateFailure {
        primary: Box<AccessError>,
        secondary: Box<AccessError>,
    },

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Timed out after waiting {waited_ms}ms: {context}")]
    WaitTimeout { waited_ms: u64, context: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccessError {
    /// Wraps `self` as the originating cause of a contextual message,
    /// per the propagation policy: every boundary names the failing
    /// operation and keeps the cause visible.
    pub fn context(self, context: impl Into<String>) -> AccessError {
        AccessError::Internal(format!("{}: {}", context.into(), self))
    }

    pub fn aggregate(primary: AccessError, secondary: AccessError) -> AccessError {
        AccessError::AggregateFailure {
            primary: Box::new(primary),
            secondary: Box::new(secondary),
        }
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(e: serde_json::Error) -> Self {
        AccessError::Configuration(format!("JSON error: {e}"))
    }
}

impl From<std::io::Error> for AccessError {
    fn from(e: std::io::Error) -> Self {
        AccessError::Persistence(format!("I/O error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;
