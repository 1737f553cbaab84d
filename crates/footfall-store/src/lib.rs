//! # footfall-store: The storage collaborator for `Footfall`
//!
//! The ingestion engine writes to an append-only store that collapses rows
//! sharing a session key by summing their [`Sign`](footfall_types::Sign)
//! column. This crate defines the minimum surface the engine needs from such
//! a store ([`Store`]) and ships [`MemoryStore`], a reference engine that
//! performs the collapse in memory.
//!
//! A real columnar client is expected to live outside this workspace and
//! implement [`Store`].

use chrono::{DateTime, Utc};
use footfall_types::{ClientId, Fingerprint, Row, SessionRow};

mod error;
mod memory;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;

/// Durable sink for ingested rows.
///
/// Implementations must be shareable across the tracker's worker threads.
pub trait Store: Send + Sync {
    /// Writes a batch of rows.
    ///
    /// Atomic from the engine's point of view: either every row of the batch
    /// is committed or none is. Row order inside the batch is significant
    /// (a retraction always precedes its replacement).
    fn save_batch(&self, rows: &[Row]) -> Result<()>;

    /// Returns the currently valid session row for a visitor, if its last
    /// activity is later than `not_older_than`.
    ///
    /// "Currently valid" means the row survives sign collapsing: it has not
    /// been cancelled by an identical `-1` row.
    fn find_session(
        &self,
        client_id: ClientId,
        fingerprint: Fingerprint,
        not_older_than: DateTime<Utc>,
    ) -> Result<Option<SessionRow>>;

    /// Verifies the store is reachable. Called once before a tracker accepts
    /// hits.
    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
