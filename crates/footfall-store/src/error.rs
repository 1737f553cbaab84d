//! Store error types.

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`Store`](crate::Store).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A batch was rejected; none of its rows were committed.
    #[error("failed to write batch of {rows} rows: {reason}")]
    WriteFailed { rows: usize, reason: String },

    /// A session lookup failed.
    #[error("session lookup failed: {0}")]
    LookupFailed(String),
}
