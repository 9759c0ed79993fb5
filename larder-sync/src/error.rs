//! Sync engine error types.

use larder_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the offline engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote service unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote service returned HTTP {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("unexpected response from remote service: {0}")]
    InvalidResponse(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record {0} is pending deletion")]
    RecordDeleted(String),

    #[error("{0} is unavailable offline")]
    UnavailableOffline(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// True for failures of the remote round trip, the ones that send
    /// writes to the action log and reads to the local copy.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnreachable(_) | SyncError::RemoteStatus { .. }
        )
    }

    /// HTTP status of a non-2xx response, if that is what this is.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::RemoteStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
