//! Attachment metadata declared in a document's `_attachments` map.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// Inline attachments larger than this should have been sent as MIME parts.
pub const INLINE_SIZE_WARNING: u64 = 1000;

/// Metadata of one declared attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    /// Attachment name (key in `_attachments`).
    pub name: String,
    /// True if the bytes arrive as a separate MIME part.
    pub follows: bool,
    /// Declared digest (`md5-...` or `sha1-...`).
    pub digest: Option<String>,
    /// Declared decoded length.
    pub length: Option<u64>,
    /// Declared encoded length, preferred over `length` when present.
    pub encoded_length: Option<u64>,
    /// True if the bytes are carried inline as base64 `data`.
    pub inline_data: bool,
}

impl AttachmentInfo {
    fn from_json(name: &str, meta: &Map<String, Value>) -> Self {
        Self {
            name: name.to_owned(),
            follows: meta.get("follows").and_then(Value::as_bool).unwrap_or(false),
            digest: meta.get("digest").and_then(Value::as_str).map(str::to_owned),
            length: meta.get("length").and_then(Value::as_u64),
            encoded_length: meta.get("encoded_length").and_then(Value::as_u64),
            inline_data: meta.contains_key("data"),
        }
    }

    /// The length the transferred bytes must have.
    pub fn expected_length(&self) -> u64 {
        self.encoded_length.or(self.length).unwrap_or(0)
    }
}

/// Lists the attachments declared by a document body.
///
/// A document without `_attachments` has none; a non-object value is an error.
pub fn declared_attachments(body: &Map<String, Value>) -> ProtocolResult<Vec<AttachmentInfo>> {
    let Some(value) = body.get("_attachments") else {
        return Ok(Vec::new());
    };
    let attachments = value.as_object().ok_or_else(|| {
        ProtocolError::UnexpectedJson("`_attachments` must be an object".into())
    })?;

    attachments
        .iter()
        .map(|(name, meta)| {
            meta.as_object()
                .map(|meta| AttachmentInfo::from_json(name, meta))
                .ok_or_else(|| {
                    ProtocolError::UnexpectedJson(format!("attachment `{name}` must be an object"))
                })
        })
        .collect()
}
