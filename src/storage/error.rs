//! Storage module error types
//!
//! Provides error types for database bootstrap and schema reconciliation,
//! and the classification used to decide whether a failed migration step
//! aborts startup or is logged and skipped.

use std::fmt;

use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// Storage operation error type
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Reading the live schema failed; the file cannot be trusted
    #[error("failed to introspect table `{table}`: {source}")]
    Introspection {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The compiled-in catalog violates one of its invariants
    #[error("invalid schema catalog: {0}")]
    InvalidCatalog(String),

    /// A migration step hit a condition the bootstrap cannot continue past
    #[error("fatal failure while applying `{step}`: {source}")]
    Fatal {
        step: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Filesystem error around the database file
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Wrap an introspection error for `table`
    pub(crate) fn introspection(table: &str, source: rusqlite::Error) -> Self {
        Self::Introspection {
            table: table.to_string(),
            source,
        }
    }
}

/// How a failed migration step is treated by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The change is already present, typically applied by a concurrent instance
    AlreadyApplied,
    /// The lock wait expired while another instance held the database
    Contended,
    /// The engine refused the statement; logged and skipped
    Rejected,
    /// The file is unusable; startup must abort
    Fatal,
}

impl FailureKind {
    /// Classify a rusqlite error raised while applying a step
    pub fn classify(err: &rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(inner, message) => {
                match inner.code {
                    ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::OutOfMemory
                    | ErrorCode::PermissionDenied => return Self::Fatal,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        return Self::Contended
                    }
                    _ => {}
                }

                let message = message.as_deref().unwrap_or_default();
                if message.contains("duplicate column name") || message.contains("already exists")
                {
                    Self::AlreadyApplied
                } else {
                    Self::Rejected
                }
            }
            _ => Self::Rejected,
        }
    }

    /// Whether the runner may continue past this failure
    pub fn is_tolerated(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyApplied => "already_applied",
            Self::Contended => "contended",
            Self::Rejected => "rejected",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}
