//! Error types for the Tollgate admission layer.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Note that an exhausted quota is not an error: it is the `Deny` variant of
/// [`crate::quota::Decision`].
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The state store timed out or could not be reached
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// A conditional write lost the race against a concurrent writer
    #[error("Version conflict on key {key}")]
    VersionConflict {
        /// Key whose record changed since it was read
        key: String,
    },

    /// A fast-path marker could not be decoded or verified
    #[error("Malformed marker: {0}")]
    MalformedMarker(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
