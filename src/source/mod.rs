//! Upstream play-history sources.
//!
//! A source only exposes a short, time-windowed slice of history per call;
//! the [`PageFetcher`](crate::fetcher::PageFetcher) walks it backwards.

pub mod memory;
pub mod spotify;

pub use memory::MemorySource;
pub use spotify::SpotifySource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::model::PlayEvent;

/// Upstream maximum for one request's `limit`.
pub const MAX_PAGE_SIZE: usize = 50;

/// One page of plays as returned by the upstream API.
#[derive(Debug, Clone, Default)]
pub struct PlayPage {
    /// Newest first
    pub events: Vec<PlayEvent>,
    /// Upstream claims older plays exist beyond this page
    pub has_more: bool,
    /// Items upstream returned, counting any dropped while decoding
    pub received: usize,
}

impl PlayPage {
    pub fn new(events: Vec<PlayEvent>, has_more: bool) -> Self {
        let received = events.len();
        Self { events, has_more, received }
    }
}

/// The windowed upstream API.
#[async_trait]
pub trait PlaySource: Send {
    fn source_name(&self) -> &str;

    /// Up to `limit` plays strictly older than `before` (or the most recent
    /// plays when `before` is `None`), newest first.
    async fn fetch_plays_before(
        &mut self,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<PlayPage, SyncError>;
}
