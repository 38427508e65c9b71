//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}
