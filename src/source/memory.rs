use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{PlayPage, PlaySource};
use crate::error::SyncError;
use crate::model::PlayEvent;

/// Scripted in-memory source with exclusive `before` paging.
#[derive(Debug, Default)]
pub struct MemorySource {
    /// Kept sorted newest first
    events: Vec<PlayEvent>,
    failures: HashMap<usize, SyncError>,
    calls: Vec<Option<DateTime<Utc>>>,
}

impl MemorySource {
    pub fn new(events: Vec<PlayEvent>) -> Self {
        let mut source = Self::default();
        source.extend(events);
        source
    }

    /// Add plays (e.g. new listening since the last sync).
    pub fn extend(&mut self, events: impl IntoIterator<Item = PlayEvent>) {
        self.events.extend(events);
        self.events.sort_by(|a, b| b.played_at.cmp(&a.played_at));
    }

    /// Make the `call`-th request (1-based, counted over the source's
    /// lifetime) fail with `error`.
    pub fn fail_on_call(&mut self, call: usize, error: SyncError) {
        self.failures.insert(call, error);
    }

    /// `before` cursors of every request made so far.
    pub fn calls(&self) -> &[Option<DateTime<Utc>>] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl PlaySource for MemorySource {
    fn source_name(&self) -> &str {
        "memory"
    }

    async fn fetch_plays_before(
        &mut self,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<PlayPage, SyncError> {
        self.calls.push(before);
        if let Some(error) = self.failures.remove(&self.calls.len()) {
            return Err(error);
        }

        let mut older = self
            .events
            .iter()
            .filter(|e| before.map_or(true, |b| e.played_at < b));
        let events: Vec<PlayEvent> = older.by_ref().take(limit).cloned().collect();
        let has_more = older.next().is_some();
        Ok(PlayPage::new(events, has_more))
    }
}
