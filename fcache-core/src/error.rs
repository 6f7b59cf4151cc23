use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Caller error: the requested operation cannot be applied to the cache as it is.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scan was cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CacheError::InvalidState(msg.into())
    }

    /// Duplicate keys and lock contention caused by a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        match self {
            CacheError::Database(e) => is_conflict(e),
            _ => false,
        }
    }
}

pub(crate) fn is_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Failures reported by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Path does not exist: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
