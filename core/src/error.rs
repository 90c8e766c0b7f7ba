//! # Error Model
//!
//! One closed error enum for the whole command surface. Configuration
//! mistakes surface synchronously through these values; interrupt-time
//! failures never do (they degrade into freezing or sample loss instead).

use core::fmt;

/// Errors returned by session commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuError {
    /// Bad register number, malformed flag combination, or an oversized
    /// sample-buffer request. For batched register operations the
    /// offending array element is additionally tagged in its flags word.
    InvalidArgument,
    /// Conflicting session exclusivity, conflicting watchpoint use, or a
    /// session already exists where one is being created.
    Busy,
    /// Acting on a protected context one does not own, or signaling a
    /// target without an adequate privilege relationship.
    PermissionDenied,
    /// Operating on a destroyed or nonexistent session or task.
    NotFound,
    /// Allocation failure for the sample buffer or context.
    ResourceExhausted,
    /// A user-memory transfer failed mid-operation.
    FaultedTransfer,
}

impl fmt::Display for PmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmuError::InvalidArgument => write!(f, "invalid argument"),
            PmuError::Busy => write!(f, "resource busy"),
            PmuError::PermissionDenied => write!(f, "permission denied"),
            PmuError::NotFound => write!(f, "no such session or task"),
            PmuError::ResourceExhausted => write!(f, "out of resources"),
            PmuError::FaultedTransfer => write!(f, "user memory transfer faulted"),
        }
    }
}

impl std::error::Error for PmuError {}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, PmuError>;
