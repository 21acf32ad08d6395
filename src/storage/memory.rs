use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::PlayStore;
use crate::error::SyncError;
use crate::model::{millis_key, HistoryEntry, PlayEvent};

/// In-memory store with the same contract as the redb backend.
#[derive(Default)]
pub struct MemoryStore {
    plays: Mutex<BTreeMap<u64, HistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, HistoryEntry>>, SyncError> {
        self.plays
            .lock()
            .map_err(|e| SyncError::Storage(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl PlayStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn insert_if_absent(&self, play: &PlayEvent) -> Result<bool, SyncError> {
        let mut plays = self.lock()?;
        match plays.entry(play.dedup_key()) {
            std::collections::btree_map::Entry::Occupied(_) => Ok(false),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(HistoryEntry {
                    play: play.clone(),
                    created_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        let (lo, hi) = (millis_key(&start), millis_key(&end));
        if lo >= hi {
            return Ok(Vec::new());
        }
        let plays = self.lock()?;
        Ok(plays.range(lo..hi).rev().map(|(_, e)| e.clone()).collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, SyncError> {
        let plays = self.lock()?;
        Ok(plays.values().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<u64, SyncError> {
        Ok(self.lock()?.len() as u64)
    }
}
