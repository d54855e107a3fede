/// Stagecoach Error Types
///
/// Error handling for the pooling and staging layer.
use thiserror::Error;

/// Main error type for staging operations
#[derive(Error, Debug)]
pub enum StageError {
    /// A caller-supplied argument was rejected before any native call or
    /// pool mutation took place
    #[error("invalid argument `{what}`: {why}")]
    InvalidArgument {
        /// Name of the offending argument
        what: &'static str,
        /// Why it was rejected
        why: String,
    },

    /// A native call failed with a non-retryable error code
    #[error("{op} failed: {message} (code {code})")]
    Native {
        /// Name of the native operation that failed
        op: &'static str,
        /// The native error code, unmodified
        code: i32,
        /// Human-readable description of the code
        message: String,
    },

    /// The native allocator could not satisfy a request
    #[error("native allocation of {size} bytes failed")]
    AllocFailed {
        /// Requested block size in bytes
        size: usize,
    },
}

/// Result type alias for staging operations
pub type Result<T> = std::result::Result<T, StageError>;

impl StageError {
    /// Create an invalid-argument error
    pub fn invalid_argument(what: &'static str, why: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            why: why.into(),
        }
    }

    /// Create a native-failure error naming the attempted operation
    pub fn native(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::Native {
            op,
            code,
            message: message.into(),
        }
    }

    /// Check if this error came out of a native call
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }
}
