//! Error types for snapvault

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for snapvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Directory walk error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Snapshot references {} missing chunk(s), first: {}", missing.len(), missing.first().map(String::as_str).unwrap_or("-"))]
    IncompleteTree { missing: Vec<String> },

    #[error("{} file(s) could not be processed", skipped.len())]
    PartialFailure { skipped: Vec<PathBuf> },

    #[error("Storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("Invalid retention rule: {reason}")]
    InvalidRetentionRule { reason: String },

    #[error("Integrity verification failed: {reason}")]
    Integrity { reason: String },

    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Invalid repository: {reason}")]
    InvalidRepository { reason: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Wrap an I/O failure on the chunk medium.
    pub(crate) fn storage(context: &str, err: std::io::Error) -> Self {
        Error::StorageUnavailable {
            reason: format!("{}: {}", context, err),
        }
    }
}

/// Result type alias for snapvault operations
pub type Result<T> = std::result::Result<T, Error>;
