//! Local storage backend: the redb history file.
//!
//! The async trait methods call straight through; redb serializes writers
//! itself, so no extra lock is held here.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::PlayStore;
use crate::error::SyncError;
use crate::history_db::PlayHistoryDb;
use crate::model::{HistoryEntry, PlayEvent};

pub struct LocalStore {
    db: PlayHistoryDb,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = PlayHistoryDb::create(path)?;
        tracing::debug!("Opened history database at {}", path.display());
        Ok(Self { db })
    }

    pub fn db(&self) -> &PlayHistoryDb {
        &self.db
    }
}

#[async_trait]
impl PlayStore for LocalStore {
    fn backend_name(&self) -> &str {
        "local"
    }

    async fn insert_if_absent(&self, play: &PlayEvent) -> Result<bool, SyncError> {
        self.db.insert_if_absent(play).map_err(|e| SyncError::storage(&e))
    }

    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        self.db.range(start, end).map_err(|e| SyncError::storage(&e))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, SyncError> {
        self.db.recent(limit).map_err(|e| SyncError::storage(&e))
    }

    async fn count(&self) -> Result<u64, SyncError> {
        self.db.count().map_err(|e| SyncError::storage(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    #[tokio::test]
    async fn test_trait_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("nested").join("history.redb")).unwrap();

        assert!(store.insert_if_absent(&play_at(0)).await.unwrap());
        assert!(!store.insert_if_absent(&play_at(0)).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_aggregate_over_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("history.redb")).unwrap();
        for play in plays_newest_first(0, 6) {
            store.insert_if_absent(&play).await.unwrap();
        }

        let start = base_time() - chrono::Duration::minutes(2);
        let end = base_time() + chrono::Duration::minutes(1);
        let stats = store.aggregate(start, end, 5).await.unwrap();
        assert_eq!(stats.total_plays, 3);
    }
}
