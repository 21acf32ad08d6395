//! Storage abstraction for the listening history.
//!
//! - [`LocalStore`]: redb file on disk (default)
//! - [`MemoryStore`]: in-process map, for tests and dry runs
//!
//! The sync merger holds an `Arc<dyn PlayStore>` and all persistence goes
//! through it.

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::model::{HistoryEntry, PlayEvent};
use crate::stats::{self, ListeningStats};

/// Append-only history store keyed by `played_at`.
#[async_trait]
pub trait PlayStore: Send + Sync {
    /// Human-readable backend name (e.g., "local", "memory").
    fn backend_name(&self) -> &str;

    // ── Write ────────────────────────────────────────────────────────

    /// Insert unless a play with the same `played_at` exists.
    ///
    /// Returns `true` if newly inserted. A key collision is `Ok(false)`,
    /// never an error. Must be a single atomic operation.
    async fn insert_if_absent(&self, play: &PlayEvent) -> Result<bool, SyncError>;

    // ── Read ─────────────────────────────────────────────────────────

    /// Plays with `start <= played_at < end`, most recent first.
    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, SyncError>;

    /// The `limit` most recent plays.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, SyncError>;

    async fn count(&self) -> Result<u64, SyncError>;

    /// Dashboard statistics over a time range.
    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Result<ListeningStats, SyncError> {
        let entries = self.query_by_time_range(start, end).await?;
        Ok(stats::aggregate(&entries, top_n))
    }
}
