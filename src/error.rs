//! Unified error handling for UniForge
//!
//! The allocator surfaces only permanent failures as errors: bad arguments
//! (oversized requests, wired limits above the working set) and resource
//! exhaustion that survives eviction. Driver out-of-memory is reported as a
//! null buffer, not an error, so callers can shrink their working set and
//! retry. Free-path and destructor driver failures are swallowed.

use thiserror::Error;

/// Unified error type for allocator operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Requested size exceeds the driver's maximum buffer length
    #[error(
        "attempting to allocate {requested} bytes which is greater than \
         the maximum allowed buffer size of {max} bytes"
    )]
    BufferTooLarge { requested: usize, max: usize },

    /// Live resource count exceeds the driver limit even after eviction
    #[error("resource limit ({0}) exceeded")]
    ResourceLimitExceeded(usize),

    /// Wired limit set above the recommended working set size
    #[error(
        "setting a wired limit of {requested} bytes larger than \
         the maximum working set size of {max} bytes is not allowed"
    )]
    WiredLimitTooLarge { requested: usize, max: usize },

    /// Internal lock poisoned - this indicates a bug
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for AllocError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AllocError::LockPoisoned(err.to_string())
    }
}

/// Result type for allocator operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Argument error - the caller passed an invalid value
    Argument,
    /// Resource exhaustion - the driver cannot hold more live buffers
    Resource,
    /// Internal error - indicates a bug
    Internal,
}

impl AllocError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            AllocError::BufferTooLarge { .. } | AllocError::WiredLimitTooLarge { .. } => {
                ErrorCategory::Argument
            }
            AllocError::ResourceLimitExceeded(_) => ErrorCategory::Resource,
            AllocError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable by the caller
    ///
    /// Resource exhaustion may clear once other callers free buffers.
    /// Argument and internal errors never will.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Resource)
    }
}
