//! Unified application error types
//!
//! Provides a single error type for the binary and for library callers
//! that want one error across storage and configuration.

use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Storage bootstrap error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// File operation error
    #[error("file operation error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Report serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable error response for machine-readable output
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for client-side handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Storage(StorageError::Fatal { .. }) => "STORAGE_FATAL",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Json(_) => "SERIALIZATION_ERROR",
        };
        Self {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for application operations
pub type Result<T> = std::result::Result<T, AppError>;
