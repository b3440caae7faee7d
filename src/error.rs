//! Error taxonomy: storage failures are fatal to the attempted write,
//! network failures are retried silently, server rejections are surfaced.

use crate::ids::IdError;

/// Local storage failure. Prior durable state is never corrupted by a
/// failed write; the caller must not assume the write happened.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failure: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

/// Sync-pass failure. `is_retryable` errors leave the pending queue
/// untouched and arm the backoff; the rest need user action.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend not configured")]
    NotConfigured,

    #[error("not logged in")]
    NotAuthenticated,

    #[error("authentication declined by server")]
    AuthDeclined,

    #[error("permission denied by server ({dropped} pending events reverted)")]
    PermissionDenied { dropped: u64 },

    #[error("server rejected sync: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// True for failures the background loop should silently retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

/// Facade-level error: everything a caller of [`crate::TallyClient`] can see.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot undo: {0}")]
    UndoRefused(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Network("connection refused".into()).is_retryable());
        assert!(SyncError::Rejected { status: 429, body: "too many requests".into() }.is_retryable());
        assert!(SyncError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(!SyncError::Rejected { status: 422, body: "bad event".into() }.is_retryable());
        assert!(!SyncError::PermissionDenied { dropped: 2 }.is_retryable());
        assert!(!SyncError::AuthDeclined.is_retryable());
    }
}
