//! SkyMemory error types

use thiserror::Error;

/// SkyMemory error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel / ingest error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Memory store error
    #[error("Store error: {0}")]
    Store(String),

    /// Reasoning service transport or response error
    #[error("Reasoning service error: {0}")]
    Reasoning(String),

    /// Malformed reasoning-service payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Work was cancelled by shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for SkyMemory operations
pub type Result<T> = std::result::Result<T, Error>;
