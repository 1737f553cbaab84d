//! Tracker error types.
//!
//! Only construction can fail. Once a tracker accepts hits, problems are
//! logged and absorbed (see [`Tracker`](crate::Tracker)).

use footfall_store::StoreError;

/// Result type for tracker construction.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors raised while building a tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The store failed its health check.
    #[error("store is not usable: {0}")]
    Store(#[from] StoreError),

    /// A background thread could not be started.
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}
