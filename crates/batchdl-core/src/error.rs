//! Error types for batchdl core

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in batchdl core
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote file not found: {0}")]
    RemoteNotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Rate limited by server")]
    RateLimited,

    #[error("Server ignored the requested byte range")]
    RangeNotSupported,

    #[error("Unexpected Content-Range: {0}")]
    UnexpectedRange(String),

    #[error("Transfer ended early: expected {expected} bytes, got {actual}")]
    Incomplete { expected: u64, actual: u64 },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Download already queued or processing: {0}")]
    AlreadyQueued(Uuid),

    #[error("Part {index} failed: {source}")]
    PartFailed {
        index: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(_)
            | DownloadError::RateLimited
            | DownloadError::UnexpectedRange(_)
            | DownloadError::Incomplete { .. } => true,
            DownloadError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether a chunked attempt hitting this error should fall back to a
    /// single stream instead of retrying in parallel
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            DownloadError::RateLimited | DownloadError::RangeNotSupported
        )
    }
}
