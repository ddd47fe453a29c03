//! Error types for the replication engine.

use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport error (refused, reset, timed out).
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote answered with an unexpected status code.
    #[error("http status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason or response body excerpt.
        message: String,
    },

    /// Protocol error (malformed JSON, missing required field).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Attachment digest or length mismatch, or an unresolvable MIME part.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed remote URL, invalid database name and similar setup errors.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Authentication or login failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The local store is not open or access to it was revoked.
    #[error("local store is closed")]
    StoreClosed,

    /// Local store failure.
    #[error("local store error: {0}")]
    Store(String),

    /// The operation was cancelled by an intentional shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an HTTP status error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for a 404 Not Found.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Returns true for a 409 Conflict.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<docsync_protocol::ProtocolError> for SyncError {
    fn from(err: docsync_protocol::ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
