use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced by the sync engine.
///
/// A `played_at` collision is never one of these: it is the normal dedup path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncError {
    /// Network or HTTP failure reaching the upstream API.
    #[error("transport error: {0}")]
    Transport(String),
    /// Expired or invalid credentials. Retrying will not help.
    #[error("auth error: {0}")]
    Auth(String),
    /// Write or read failure in the history store.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }

    pub fn auth(err: impl std::fmt::Display) -> Self {
        SyncError::Auth(err.to_string())
    }

    /// Wrap an internal `anyhow` error, keeping its context chain.
    pub fn storage(err: &anyhow::Error) -> Self {
        SyncError::Storage(format!("{err:#}"))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Whether the triggering mechanism may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}
