//! Error types shared by the TMAC crates.

/// Errors produced while building or running a TMAC model.
///
/// Every variant is a contract violation detected synchronously; no
/// caller is expected to retry.
///
/// # Example
///
/// ```
/// use tmac_core::TmacError;
///
/// let err = TmacError::ChildCountMismatch {
///     unit: "ControlUnit".to_string(),
///     expected: 2,
///     got: 1,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TmacError {
    /// The `children_list` does not describe a valid reasoning tree.
    #[error("invalid topology: {message}")]
    InvalidTopology { message: String },

    /// A unit received a different number of parent vectors than its arity.
    #[error("{unit}: expected {expected} parent vectors, got {got}")]
    ChildCountMismatch {
        unit: String,
        expected: usize,
        got: usize,
    },

    /// An input tensor does not have the documented shape.
    #[error("shape mismatch: {message}")]
    ShapeMismatch { message: String },

    /// A control/memory slot was written twice, or slot 0 was overwritten.
    #[error("storage violation: {message}")]
    StorageViolation { message: String },

    /// Invalid or unreadable configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Failure inside the numeric backend.
    #[error("internal error: {message}")]
    Internal { message: String },
}
