//! GPU error types.

use thiserror::Error;

/// Errors raised by the buffer engine and its backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The device could not create a backing allocation.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The device was removed or reset. Fatal, never retried.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// The caller broke an API contract (alignment, bounds, map discipline, usage).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A device call failed for another reason.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Internal protocol violation.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the error means the device is gone and nothing can recover it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
