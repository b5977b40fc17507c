//! Error types for the persistence layer.

use thiserror::Error;

/// Errors raised by the store adapter and the record mappers.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// A caller named a column that the mapper does not allow updating.
    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record in {table}: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },

    #[error("Invalid stage transition for ingest {ingest_id}: {from} -> {to}")]
    InvalidStageTransition {
        ingest_id: i64,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RepositoryError {
    pub(crate) fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the repository modules.
pub type Result<T> = std::result::Result<T, RepositoryError>;
