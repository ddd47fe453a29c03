//! Test fixtures and session helpers.
//!
//! Builders for revision bodies and `multipart/related` documents, plus
//! waits on session state that fail the test instead of hanging it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use docsync_engine::{ReplicationSession, ReplicationState};
use md5::{Digest, Md5};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Boundary used by [`multipart_document`].
pub const BOUNDARY: &str = "docsync-testkit-boundary";

/// How long the wait helpers wait before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// An attachment served with a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Attachment name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Raw content.
    pub data: Bytes,
}

impl Attachment {
    /// Creates an attachment.
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// The `md5-<base64>` digest CouchDB reports for this content.
    pub fn digest(&self) -> String {
        md5_digest(&self.data)
    }
}

/// The `md5-<base64>` digest of `data`.
pub fn md5_digest(data: &[u8]) -> String {
    format!("md5-{}", STANDARD.encode(Md5::digest(data)))
}

/// Builds a revision body with `_revisions` for `history`, newest first.
///
/// `fields` must be a JSON object; its members are copied into the body.
pub fn revision_body(doc_id: &str, history: &[&str], fields: Value) -> Map<String, Value> {
    let mut body = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.insert("_id".into(), Value::String(doc_id.to_owned()));
    if let Some(rev) = history.first() {
        body.insert("_rev".into(), Value::String((*rev).to_owned()));
    }
    body.insert("_revisions".into(), revisions_json(history));
    body
}

/// The `_revisions` member for a history, newest first.
pub fn revisions_json(history: &[&str]) -> Value {
    let start = history
        .first()
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(0);
    let ids: Vec<&str> = history
        .iter()
        .map(|rev| rev.split_once('-').map_or(*rev, |(_, suffix)| suffix))
        .collect();
    json!({"start": start, "ids": ids})
}

/// Encodes a document and its attachments as a `multipart/related` body.
///
/// Returns the `Content-Type` header value and the body. The document's
/// `_attachments` member is replaced by `follows` stubs for `attachments`.
pub fn multipart_document(body: &Map<String, Value>, attachments: &[Attachment]) -> (String, Bytes) {
    let mut doc = body.clone();
    let generation = doc
        .get("_rev")
        .and_then(Value::as_str)
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(1);
    let stubs: Map<String, Value> = attachments
        .iter()
        .map(|a| {
            let stub = json!({
                "content_type": a.content_type,
                "length": a.data.len(),
                "digest": a.digest(),
                "revpos": generation,
                "follows": true,
            });
            (a.name.clone(), stub)
        })
        .collect();
    doc.insert("_attachments".into(), Value::Object(stubs));

    let mut out = Vec::new();
    out.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: application/json\r\n\r\n").as_bytes());
    out.extend_from_slice(Value::Object(doc).to_string().as_bytes());
    for attachment in attachments {
        out.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                attachment.name, attachment.content_type
            )
            .as_bytes(),
        );
        out.extend_from_slice(&attachment.data);
    }
    out.extend_from_slice(format!("\r\n--{BOUNDARY}--").as_bytes());

    let content_type = format!("multipart/related; boundary=\"{BOUNDARY}\"");
    (content_type, Bytes::from(out))
}

/// Waits until the session is in `state`.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`].
pub async fn wait_for_state(session: &ReplicationSession, state: ReplicationState) {
    let mut states = session.subscribe_state();
    let reached = tokio::time::timeout(WAIT_TIMEOUT, states.wait_for(|s| *s == state)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "{} never reached {state}; it is {}",
        session.id(),
        session.state()
    );
}

/// Waits until the session stops.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`].
pub async fn wait_for_stop(session: &ReplicationSession) {
    let stopped = tokio::time::timeout(WAIT_TIMEOUT, session.stopped()).await;
    assert!(stopped.is_ok(), "{} did not stop; it is {}", session.id(), session.state());
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
