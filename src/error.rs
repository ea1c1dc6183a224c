//! Error types for deferkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for deferkv operations
#[derive(Debug, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Durable Log Errors
    // -------------------------------------------------------------------------
    #[error("Log corruption detected: {0}")]
    LogCorruption(String),

    /// The write could not be made durable; nothing else was changed
    #[error("Log append failed: {0}")]
    LogAppend(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Database Errors
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Key not found")]
    NotFound,

    #[error("Retries exhausted for key {key} after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    /// A synchronous flush ended with keys still dirty
    #[error("Flush incomplete: {remaining} keys still dirty")]
    FlushIncomplete { remaining: usize },

    // -------------------------------------------------------------------------
    // Configuration / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache is shut down")]
    Closed,
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
