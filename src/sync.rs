//! Incremental sync: pull pages from a [`PlaySource`] and merge each one into
//! a [`PlayStore`] before asking for the next.
//!
//! Idempotence rests entirely on the store's `insert_if_absent`: overlapping
//! runs race on the same keys and all but one insert per key become skips.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::error::SyncError;
use crate::fetcher::{PageFetcher, DEFAULT_PAGE_SIZE};
use crate::model::PlayEvent;
use crate::source::PlaySource;
use crate::storage::PlayStore;

/// Why a sync run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source had no older plays
    #[default]
    Exhausted,
    /// `max_pages` pages were requested
    PageBudget,
    /// The cancel flag was seen at a page boundary
    Cancelled,
    /// A fetch or storage error aborted the run
    Failed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "exhausted"),
            StopReason::PageBudget => write!(f, "page budget reached"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one sync run. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub fetched: usize,
    pub added: usize,
    pub skipped: usize,
    pub pages_fetched: usize,
    pub errors: Vec<SyncError>,
    pub stop_reason: StopReason,
}

impl SyncSummary {
    /// The run checked upstream successfully, whether or not it found new plays.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_auth_error(&self) -> bool {
        self.errors.iter().any(SyncError::is_auth)
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {} plays over {} pages: {} added, {} skipped ({})",
            self.fetched, self.pages_fetched, self.added, self.skipped, self.stop_reason
        )?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

pub struct SyncMerger<S: PlaySource> {
    source: S,
    store: Arc<dyn PlayStore>,
    page_size: usize,
    cancel: Option<Arc<AtomicBool>>,
}

impl<S: PlaySource> SyncMerger<S> {
    pub fn new(source: S, store: Arc<dyn PlayStore>) -> Self {
        Self {
            source,
            store,
            page_size: DEFAULT_PAGE_SIZE,
            cancel: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Honor `flag` between pages. A page already requested is always merged.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn store(&self) -> &Arc<dyn PlayStore> {
        &self.store
    }

    /// Pull up to `max_pages` pages and persist every unseen play.
    ///
    /// Never fails as a whole: errors end the run and are reported in the
    /// summary next to whatever was merged before them.
    pub async fn sync(&mut self, max_pages: usize) -> SyncSummary {
        let started = Instant::now();
        tracing::info!(
            "Starting sync from {} into {} store (max_pages={}, page_size={})",
            self.source.source_name(),
            self.store.backend_name(),
            max_pages,
            self.page_size
        );

        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let mut summary = SyncSummary::default();
        let mut fetcher = PageFetcher::new(&mut self.source, max_pages, self.page_size);

        let stop_reason = loop {
            if fetcher.is_done() {
                break if fetcher.is_exhausted() {
                    StopReason::Exhausted
                } else {
                    StopReason::PageBudget
                };
            }
            if cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                tracing::info!("Sync cancelled after {} pages", summary.pages_fetched);
                break StopReason::Cancelled;
            }

            let events = match fetcher.next_page().await {
                Ok(Some(events)) => events,
                Ok(None) => continue,
                Err(e) => {
                    summary.errors.push(e);
                    break StopReason::Failed;
                }
            };
            summary.pages_fetched += 1;
            summary.fetched += events.len();

            let result = merge_page(store.as_ref(), &events, &mut summary).await;
            tracing::info!(
                "Page {}: {} plays, totals {} added / {} skipped",
                summary.pages_fetched,
                events.len(),
                summary.added,
                summary.skipped
            );
            if let Err(e) = result {
                summary.errors.push(e);
                break StopReason::Failed;
            }
        };
        summary.stop_reason = stop_reason;

        let elapsed_ms = started.elapsed().as_millis();
        if summary.has_auth_error() {
            tracing::error!(
                "Sync aborted by an authentication failure, re-authenticate before retrying: {}",
                summary
            );
        } else if !summary.is_success() {
            tracing::warn!("Sync ended with errors after {}ms: {}", elapsed_ms, summary);
        } else if summary.fetched == 0 {
            tracing::info!("Sync complete in {}ms: no plays upstream", elapsed_ms);
        } else {
            tracing::info!("Sync complete in {}ms: {}", elapsed_ms, summary);
        }
        summary
    }
}

/// Insert one page, counting adds and skips into `summary` as it goes.
///
/// A storage failure stops the rest of the page; earlier inserts stay.
async fn merge_page(
    store: &dyn PlayStore,
    events: &[PlayEvent],
    summary: &mut SyncSummary,
) -> Result<(), SyncError> {
    for event in events {
        if store.insert_if_absent(event).await? {
            summary.added += 1;
        } else {
            tracing::trace!("Already stored: play at {}", event.played_at);
            summary.skipped += 1;
        }
    }
    Ok(())
}
