//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding wire-format data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON could not be parsed.
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON value had an unexpected shape.
    #[error("unexpected json: {0}")]
    UnexpectedJson(String),

    /// A required field was missing.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A content type could not be used.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// A MIME multipart body was malformed.
    #[error("malformed multipart body: {0}")]
    Multipart(String),
}
