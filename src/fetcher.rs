//! Backward-in-time pagination over a windowed [`PlaySource`].
//!
//! Starts at "now" and walks older using the oldest `played_at` of each page
//! as the exclusive upper bound of the next request. The loop state is
//! explicit so the page budget is a plain counter.

use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::model::PlayEvent;
use crate::source::{PlaySource, MAX_PAGE_SIZE};

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Result of collecting a whole run's pages.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Newest first, possibly including plays already stored
    pub events: Vec<PlayEvent>,
    pub pages_fetched: usize,
    /// The source ran out of older plays
    pub exhausted: bool,
    /// Set when a page failed; `events` still holds the earlier pages
    pub error: Option<SyncError>,
}

pub struct PageFetcher<'a, S: PlaySource + ?Sized> {
    source: &'a mut S,
    page_size: usize,
    cursor: Option<DateTime<Utc>>,
    pages_left: usize,
    pages_fetched: usize,
    exhausted: bool,
}

impl<'a, S: PlaySource + ?Sized> PageFetcher<'a, S> {
    pub fn new(source: &'a mut S, max_pages: usize, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            cursor: None,
            pages_left: max_pages,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// The source has no older plays left. Distinct from running out of budget.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    /// No further request will be made: exhausted, failed or out of budget.
    pub fn is_done(&self) -> bool {
        self.exhausted || self.pages_left == 0
    }

    /// Request the next older page.
    ///
    /// `Ok(None)` once the source is exhausted or the page budget is spent.
    /// A failed request ends pagination; pages already returned stay valid.
    pub async fn next_page(&mut self) -> Result<Option<Vec<PlayEvent>>, SyncError> {
        if self.exhausted || self.pages_left == 0 {
            return Ok(None);
        }

        let page = match self.source.fetch_plays_before(self.cursor, self.page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(
                    "Fetching page {} from {} failed: {}",
                    self.pages_fetched + 1,
                    self.source.source_name(),
                    e
                );
                self.exhausted = true;
                return Err(e);
            }
        };
        self.pages_left -= 1;
        self.pages_fetched += 1;

        let oldest = page.events.iter().map(|e| e.played_at).min();
        // Decoding may drop malformed items; only the upstream count says
        // whether the window itself came back short.
        let short_page = page.received < self.page_size;
        let stalled = match (oldest, self.cursor) {
            (Some(oldest), Some(cursor)) => oldest >= cursor,
            _ => false,
        };

        if page.events.is_empty() || short_page || !page.has_more {
            self.exhausted = true;
        } else if stalled {
            tracing::warn!(
                "Source returned plays no older than cursor {:?}, treating history as exhausted",
                self.cursor
            );
            self.exhausted = true;
        }
        if !stalled {
            self.cursor = oldest.or(self.cursor);
        }

        tracing::debug!(
            "Page {}: {} plays, cursor={:?}, exhausted={}",
            self.pages_fetched,
            page.events.len(),
            self.cursor,
            self.exhausted
        );
        Ok(Some(page.events))
    }

    /// Drain every remaining page into one newest-first sequence.
    pub async fn collect(mut self) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        loop {
            match self.next_page().await {
                Ok(Some(events)) => outcome.events.extend(events),
                Ok(None) => break,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome.pages_fetched = self.pages_fetched;
        outcome.exhausted = self.exhausted && outcome.error.is_none();
        outcome
    }
}

/// Fetch up to `max_pages` pages of history from `source`, newest first.
pub async fn fetch_history<S: PlaySource + ?Sized>(
    source: &mut S,
    max_pages: usize,
    page_size: usize,
) -> FetchOutcome {
    PageFetcher::new(source, max_pages, page_size).collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::source::{MemorySource, PlayPage};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_fewer_than_page_size_is_one_page() {
        let mut source = MemorySource::new(plays_newest_first(0, 7));
        let outcome = fetch_history(&mut source, 5, 10).await;

        assert_eq!(outcome.events.len(), 7);
        assert_eq!(outcome.pages_fetched, 1);
        assert!(outcome.exhausted);
        assert!(outcome.error.is_none());
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_page_budget_bounds_requests() {
        let mut source = MemorySource::new(plays_newest_first(0, 100));
        let outcome = fetch_history(&mut source, 3, 10).await;

        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.events.len(), 30);
        assert!(!outcome.exhausted);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_on_has_more() {
        let mut source = MemorySource::new(plays_newest_first(0, 20));
        let outcome = fetch_history(&mut source, 5, 10).await;

        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.events.len(), 20);
        assert!(outcome.exhausted);
    }

    #[tokio::test]
    async fn test_cursor_is_oldest_of_previous_page() {
        let plays = plays_newest_first(0, 25);
        let mut source = MemorySource::new(plays.clone());
        let outcome = fetch_history(&mut source, 5, 10).await;

        assert_eq!(outcome.events, plays);
        assert_eq!(
            source.calls(),
            &[None, Some(plays[9].played_at), Some(plays[19].played_at)]
        );
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut source = MemorySource::new(Vec::new());
        let outcome = fetch_history(&mut source, 5, 50).await;

        assert!(outcome.events.is_empty());
        assert_eq!(outcome.pages_fetched, 1);
        assert!(outcome.exhausted);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_error_preserves_earlier_pages() {
        let mut source = MemorySource::new(plays_newest_first(0, 50));
        source.fail_on_call(3, SyncError::transport("connection reset"));
        let outcome = fetch_history(&mut source, 5, 10).await;

        assert_eq!(outcome.events.len(), 20);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.error, Some(SyncError::transport("connection reset")));
        assert!(!outcome.exhausted);
    }

    #[tokio::test]
    async fn test_zero_budget_makes_no_requests() {
        let mut source = MemorySource::new(plays_newest_first(0, 5));
        let outcome = fetch_history(&mut source, 0, 10).await;
        assert_eq!(outcome.pages_fetched, 0);
        assert!(source.calls().is_empty());
    }

    /// Ignores `before` and always serves the same full page.
    struct StuckSource {
        page: Vec<PlayEvent>,
        calls: usize,
    }

    #[async_trait]
    impl PlaySource for StuckSource {
        fn source_name(&self) -> &str {
            "stuck"
        }

        async fn fetch_plays_before(
            &mut self,
            _before: Option<DateTime<Utc>>,
            _limit: usize,
        ) -> Result<PlayPage, SyncError> {
            self.calls += 1;
            Ok(PlayPage::new(self.page.clone(), true))
        }
    }

    #[tokio::test]
    async fn test_stalled_cursor_stops() {
        let mut source = StuckSource { page: plays_newest_first(0, 10), calls: 0 };
        let outcome = fetch_history(&mut source, 10, 10).await;

        assert_eq!(source.calls, 2);
        assert_eq!(outcome.pages_fetched, 2);
        assert!(outcome.exhausted);
    }

    /// Drops one decoded play from the first page, as a malformed item would.
    struct LossySource {
        inner: MemorySource,
        dropped: bool,
    }

    #[async_trait]
    impl PlaySource for LossySource {
        fn source_name(&self) -> &str {
            "lossy"
        }

        async fn fetch_plays_before(
            &mut self,
            before: Option<DateTime<Utc>>,
            limit: usize,
        ) -> Result<PlayPage, SyncError> {
            let mut page = self.inner.fetch_plays_before(before, limit).await?;
            if !self.dropped && page.events.len() > 10 {
                page.events.remove(10);
                self.dropped = true;
            }
            Ok(page)
        }
    }

    #[tokio::test]
    async fn test_dropped_item_does_not_end_paging() {
        let mut source = LossySource {
            inner: MemorySource::new(plays_newest_first(0, 150)),
            dropped: false,
        };
        let outcome = fetch_history(&mut source, 5, 50).await;

        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.events.len(), 149);
        assert!(outcome.exhausted);
        assert_eq!(source.inner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_page_size_clamped_to_upstream_max() {
        let mut source = MemorySource::new(plays_newest_first(0, 120));
        let outcome = fetch_history(&mut source, 1, 500).await;
        assert_eq!(outcome.events.len(), MAX_PAGE_SIZE);
    }
}
