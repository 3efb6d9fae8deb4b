//! Backend errors, folded into [`StoreError`] at the trait boundary

use evalboard_core::StoreError;

/// Errors raised inside the SQLite backend
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    /// SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure while opening the database
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be decoded
    #[error("corrupt row: {0}")]
    Decode(String),

    /// Blocking task panicked
    #[error("task join error: {0}")]
    Join(String),

    /// Contract error raised by the backend itself
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for SqliteError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<SqliteError> for StoreError {
    fn from(value: SqliteError) -> Self {
        match value {
            SqliteError::Store(inner) => inner,
            SqliteError::Decode(msg) => StoreError::Serialization(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
