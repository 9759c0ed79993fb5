//! Local store error types.

use thiserror::Error;

/// Result type for local store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the local object store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("local storage unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {partition}/{key}")]
    NotFound { partition: String, key: String },

    #[error("duplicate key in {partition}: {key}")]
    DuplicateKey { partition: String, key: String },

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("unknown index {index} on partition {partition}")]
    UnknownIndex { partition: String, index: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("store connection closed")]
    ConnectionClosed,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Returns true when the error means the connection handle went bad and
    /// reopening the store may succeed.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            StorageError::ConnectionClosed => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::SchemaChanged
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}
