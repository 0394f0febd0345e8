//! Error types for pagepulse-core
//!
//! One thiserror hierarchy shared by the store, the config loader and the
//! cache producers. The event buffer never surfaces these to producers.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for pagepulse operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // IO Errors
    // ===================
    #[error("Failed to read file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Failed to parse config in {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Could not determine data directory")]
    DataDirNotFound,

    // ===================
    // Storage Errors
    // ===================
    #[error("Database error during {operation}")]
    Database {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database busy after {attempts} attempts: {operation}")]
    DatabaseBusy { operation: String, attempts: u32 },

    #[error("Failed to encode query result: {message}")]
    Encode { message: String },

    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    // ===================
    // Runtime Errors
    // ===================
    #[error("No tokio runtime available: {message}")]
    NoRuntime { message: String },

    #[error("Background task failed: {message}")]
    TaskJoin { message: String },
}

impl CoreError {
    /// Wrap a rusqlite error with the operation that produced it
    pub fn database(operation: impl Into<String>, source: rusqlite::Error) -> Self {
        CoreError::Database {
            operation: operation.into(),
            source,
        }
    }

    /// True for transient lock contention that is worth retrying
    pub fn is_busy(&self) -> bool {
        match self {
            CoreError::Database {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_detection() {
        let busy = CoreError::database(
            "insert",
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ),
        );
        assert!(busy.is_busy());

        let other = CoreError::database("insert", rusqlite::Error::QueryReturnedNoRows);
        assert!(!other.is_busy());

        let unavailable = CoreError::StorageUnavailable {
            message: "down".to_string(),
        };
        assert!(!unavailable.is_busy());
    }

    #[test]
    fn test_error_messages() {
        let err = CoreError::DatabaseBusy {
            operation: "insert_batch".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Database busy after 3 attempts: insert_batch"
        );
    }
}
