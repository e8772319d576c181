//! Error handling module for Timekeeper.
//!
//! This module provides a unified error type using the `thiserror` crate,
//! consolidating the failures of persistence, configuration and the archive
//! into a single enum.

use std::io;
use thiserror::Error;

/// Unified error type for the Timekeeper engine.
///
/// This enum represents all possible errors that can occur in the engine,
/// providing automatic conversions from underlying error types.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// I/O operation errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Archive database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Data file errors
    #[error("Data file error: {0}")]
    DataFile(String),

    /// Lock acquisition errors
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Archive gateway errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Generic operation errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Timekeeper operations
pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    /// Create a data file error
    pub fn data_file(msg: impl Into<String>) -> Self {
        TrackerError::DataFile(msg.into())
    }

    /// Create a lock failure error
    pub fn lock(msg: impl Into<String>) -> Self {
        TrackerError::LockFailed(msg.into())
    }

    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        TrackerError::Archive(msg.into())
    }

    /// Create a generic other error
    pub fn other(msg: impl Into<String>) -> Self {
        TrackerError::Other(msg.into())
    }
}

impl From<String> for TrackerError {
    fn from(s: String) -> Self {
        TrackerError::Other(s)
    }
}

impl From<&str> for TrackerError {
    fn from(s: &str) -> Self {
        TrackerError::Other(s.to_string())
    }
}

impl From<r2d2::Error> for TrackerError {
    fn from(e: r2d2::Error) -> Self {
        TrackerError::Archive(format!("connection pool: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::lock("data file busy");
        assert_eq!(err.to_string(), "Failed to acquire lock: data file busy");

        let err: TrackerError = "plain".into();
        assert_eq!(err.to_string(), "plain");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: TrackerError = io_err.into();
        assert!(matches!(err, TrackerError::Io(_)));
    }
}
