//! playlog: incremental sync of a streaming service's recently-played window
//! into a durable, duplicate-free listening history.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod history_db;
pub mod model;
pub mod source;
pub mod stats;
pub mod storage;
pub mod sync;

pub use error::SyncError;
pub use model::{HistoryEntry, PlayEvent};
pub use sync::{StopReason, SyncMerger, SyncSummary};
