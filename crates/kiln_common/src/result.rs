//! Common result and error types for the Kiln toolchain.

/// The result type returned across the code-generator boundary.
///
/// `Err` means the external collaborator failed to produce an artifact. It is
/// not a cache miss: misses are ordinary values and never reach this type.
pub type KilnResult<T> = Result<T, InternalError>;

/// A failure reported by a collaborator outside the cache core, such as the
/// code generator.
#[derive(Debug, thiserror::Error)]
#[error("internal error: {message}")]
pub struct InternalError {
    /// Description of the failure.
    pub message: String,
}

impl InternalError {
    /// Creates a new internal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for InternalError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
