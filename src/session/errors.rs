//! Error types for the session store.

use thiserror::Error;

/// Session store error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Record (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The backing store refused the operation.
    #[error("storage unavailable: {0}")]
    Storage(String),
    /// A guarded operation returned a response whose `ok` flag was false.
    #[error("API call reported failure (ok = false)")]
    NotOk,
    /// A guarded operation returned a status outside `[200, 300)`.
    #[error("API failed with status {0}")]
    Status(i64),
    /// A guarded operation failed outright.
    #[error("operation failed: {0}")]
    Operation(String),
}

/// Convenience result alias for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;
