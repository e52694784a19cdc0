//! Common error types for Tether.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for Tether operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (connection refused, reset, DNS, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// An attempt did not complete before its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// Background sync task is not running or dropped a reply.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether this error came from talking to the remote side.
    ///
    /// Every such failure is retried identically by the executor; the
    /// status code of a non-2xx response is not inspected.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Status { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(10)).is_transient());
        assert!(Error::Status {
            status: 503,
            url: "/api".into()
        }
        .is_transient());
        assert!(!Error::Storage("disk full".into()).is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
    }

    #[test]
    fn test_status_display() {
        let err = Error::Status {
            status: 404,
            url: "https://example.com/api/patterns".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404 from https://example.com/api/patterns");
    }
}
