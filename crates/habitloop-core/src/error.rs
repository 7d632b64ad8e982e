//! Core error types for habitloop-core.
//!
//! This module defines a comprehensive error hierarchy using thiserror
//! for better error handling and reporting across the library.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for habitloop-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Store-related errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A write kept failing after every configured attempt
    #[error("Gave up on habit '{habit_id}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        habit_id: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
}

/// Store-specific errors, shared by every backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No document with the requested id
    #[error("Habit '{id}' not found")]
    NotFound { id: String },

    /// A stored field was missing or carried the wrong type
    #[error("Bad document '{id}': {message}")]
    FieldDecode { id: String, message: String },

    /// The backend rejected or lost a write
    #[error("Write to '{id}' failed: {message}")]
    WriteFailed {
        id: String,
        message: String,
        retryable: bool,
    },

    /// A conditional update lost the version race
    #[error("Version conflict on '{id}': expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Failed to open the local database
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Backend read or query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Local database is locked by another writer
    #[error("Database is locked")]
    Locked,

    /// Transport failure talking to the hosted store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON in a document body or response
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same write has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::WriteFailed { retryable, .. } => *retryable,
            StoreError::Locked => true,
            StoreError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Day index outside the current week window
    #[error("Day index {index} out of range (expected 0..7)")]
    DayIndexOutOfRange { index: usize },

    /// Weekly target outside the representable range
    #[error("Frequency {frequency} out of range (expected 0..=7)")]
    FrequencyOutOfRange { frequency: u8 },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
