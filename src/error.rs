//! Error types for tvcache

use std::io;
use thiserror::Error;

/// Result type for tvcache operations
pub type Result<T> = std::result::Result<T, TvError>;

/// Boxed error carried by streamed response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in tvcache
#[derive(Debug, Error)]
pub enum TvError {
    /// Replay id failed strict alphanumeric validation
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Absent locally and upstream
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport or HTTP failure talking to the upstream service
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The rewrite pass could not establish a final chunk count
    #[error("Inconsistent capture: {0}")]
    InconsistentCapture(String),

    /// Unknown event group requested for a cached replay
    #[error("Invalid event group: {0}")]
    InvalidGroup(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON document could not be read or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl TvError {
    /// Whether the error was caused by the caller rather than by us or upstream
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentifier(_) | Self::InvalidGroup(_) | Self::NotFound(_)
        )
    }
}
