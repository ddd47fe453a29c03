//! Reader for document fetch responses.
//!
//! A response is either plain JSON or a MIME multipart body whose first part
//! is the document and whose remaining parts are attachment payloads. Parts
//! are streamed into blob writers from the local store; on [`finish`] the
//! declared `_attachments` are reconciled with the parts received and every
//! length and digest is verified.
//!
//! [`finish`]: MultipartDocumentReader::finish

use crate::error::{SyncError, SyncResult};
use crate::http::HttpResponse;
use crate::store::{AttachmentWriters, BlobWriter, LocalStore};
use docsync_protocol::mime::disposition_filename;
use docsync_protocol::{
    declared_attachments, MultipartTokenizer, PartHandler, PartHeaders, INLINE_SIZE_WARNING,
};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

enum Body {
    Json(Vec<u8>),
    Multipart {
        tokenizer: MultipartTokenizer,
        parts: PartCollector,
    },
}

/// Decodes a document and its attachments from a streamed response.
pub struct MultipartDocumentReader {
    store: Arc<dyn LocalStore>,
    body: Body,
}

impl MultipartDocumentReader {
    /// Creates a reader for a response with the given content type.
    ///
    /// `multipart/*`, `application/json` and `text/plain` are accepted
    /// (CouchDB sends JSON as `text/plain` to some clients). A missing
    /// content type is treated as JSON.
    pub fn new(content_type: Option<&str>, store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let body = match content_type {
            None => Body::Json(Vec::new()),
            Some(ct) if starts_with_ignore_case(ct, "multipart/") => Body::Multipart {
                tokenizer: MultipartTokenizer::from_content_type(ct)?,
                parts: PartCollector::new(store.clone()),
            },
            Some(ct)
                if starts_with_ignore_case(ct, "application/json")
                    || starts_with_ignore_case(ct, "text/plain") =>
            {
                Body::Json(Vec::new())
            }
            Some(ct) => {
                return Err(SyncError::Protocol(format!(
                    "unsupported document content type `{ct}`"
                )))
            }
        };
        Ok(Self { store, body })
    }

    /// Appends response bytes. Chunk boundaries carry no meaning.
    pub fn append_data(&mut self, data: &[u8]) -> SyncResult<()> {
        match &mut self.body {
            Body::Json(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Body::Multipart { tokenizer, parts } => tokenizer.append(data, parts),
        }
    }

    /// Completes the parse and returns the document body.
    ///
    /// For multipart bodies the attachment writers are handed to the local
    /// store, keyed by MD5 digest.
    pub fn finish(self) -> SyncResult<Map<String, Value>> {
        match self.body {
            Body::Json(buf) => parse_document(&buf),
            Body::Multipart { tokenizer, parts } => {
                if !tokenizer.is_finished() {
                    return Err(SyncError::Integrity(
                        "received incomplete MIME multipart response".into(),
                    ));
                }
                let (document, writers) = parts.reconcile()?;
                if !writers.is_empty() {
                    self.store.remember_attachment_writers(writers);
                }
                Ok(document)
            }
        }
    }

    /// Reads a whole response through a new reader.
    pub async fn read_response(
        response: HttpResponse,
        store: Arc<dyn LocalStore>,
    ) -> SyncResult<Map<String, Value>> {
        let mut reader = Self::new(response.content_type(), store)?;
        let mut body = response.into_body();
        while let Some(chunk) = body.next().await {
            reader.append_data(&chunk?)?;
        }
        reader.finish()
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn parse_document(buf: &[u8]) -> SyncResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(buf)? {
        Value::Object(document) => Ok(document),
        _ => Err(SyncError::Protocol("document body is not a JSON object".into())),
    }
}

/// Receives MIME parts: the first is the document, the rest attachments.
struct PartCollector {
    store: Arc<dyn LocalStore>,
    json: Option<Vec<u8>>,
    document: Option<Map<String, Value>>,
    current: Option<(Box<dyn BlobWriter>, Option<String>)>,
    by_name: BTreeMap<String, String>,
    by_digest: AttachmentWriters,
}

impl PartCollector {
    fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            json: None,
            document: None,
            current: None,
            by_name: BTreeMap::new(),
            by_digest: BTreeMap::new(),
        }
    }

    /// Matches declared attachments to parts and verifies them.
    fn reconcile(self) -> SyncResult<(Map<String, Value>, AttachmentWriters)> {
        let mut document = self
            .document
            .ok_or_else(|| SyncError::Integrity("multipart response has no document part".into()))?;
        let declared = declared_attachments(&document)?;
        let writers = self.by_digest;

        let digestless = declared
            .iter()
            .filter(|info| info.follows && info.digest.is_none())
            .count();
        let mut claimed = BTreeSet::new();
        let mut resolved = Vec::new();

        for info in &declared {
            if !info.follows {
                if info.inline_data && info.expected_length() > INLINE_SIZE_WARNING {
                    warn!(
                        attachment = %info.name,
                        length = info.expected_length(),
                        "large attachment sent inline; should be a MIME part"
                    );
                }
                continue;
            }

            let md5 = if let Some(md5) = self.by_name.get(&info.name) {
                if let Some(declared) = &info.digest {
                    let writer = &writers[md5];
                    if declared != md5 && *declared != writer.sha1_digest() {
                        return Err(SyncError::Integrity(format!(
                            "attachment `{}` has incorrect digest ({declared}; should be {md5} or {})",
                            info.name,
                            writer.sha1_digest()
                        )));
                    }
                }
                md5.clone()
            } else if let Some(declared) = &info.digest {
                writers
                    .iter()
                    .find(|(md5, writer)| *md5 == declared || writer.sha1_digest() == *declared)
                    .map(|(md5, _)| md5.clone())
                    .ok_or_else(|| {
                        SyncError::Integrity(format!(
                            "attachment `{}` does not appear in MIME body",
                            info.name
                        ))
                    })?
            } else if digestless == 1 && writers.len() == 1 {
                let only = writers.keys().next().cloned().unwrap_or_default();
                if claimed.contains(&only) {
                    return Err(SyncError::Integrity(format!(
                        "attachment `{}` has no digest and the only MIME body is taken",
                        info.name
                    )));
                }
                only
            } else {
                return Err(SyncError::Integrity(format!(
                    "attachment `{}` has no digest metadata; cannot identify MIME body",
                    info.name
                )));
            };

            let actual = writers[&md5].length();
            if actual != info.expected_length() {
                return Err(SyncError::Integrity(format!(
                    "attachment `{}` has incorrect length field {} (should be {actual})",
                    info.name,
                    info.expected_length()
                )));
            }

            claimed.insert(md5.clone());
            resolved.push((info.name.clone(), md5));
        }

        if resolved.len() < writers.len() {
            return Err(SyncError::Integrity(format!(
                "more MIME bodies ({}) than attachments ({})",
                writers.len(),
                resolved.len()
            )));
        }

        if let Some(Value::Object(attachments)) = document.get_mut("_attachments") {
            for (name, md5) in resolved {
                if let Some(Value::Object(meta)) = attachments.get_mut(&name) {
                    meta.insert("digest".into(), Value::String(md5));
                }
            }
        }

        Ok((document, writers))
    }
}

impl PartHandler for PartCollector {
    type Error = SyncError;

    fn started_part(&mut self, headers: &PartHeaders) -> SyncResult<()> {
        if self.document.is_none() {
            self.json = Some(Vec::new());
            return Ok(());
        }
        let writer = self.store.attachment_writer()?;
        let name = headers
            .get("content-disposition")
            .and_then(disposition_filename);
        self.current = Some((writer, name));
        Ok(())
    }

    fn part_data(&mut self, data: &[u8]) -> SyncResult<()> {
        if let Some(json) = self.json.as_mut() {
            json.extend_from_slice(data);
            return Ok(());
        }
        match self.current.as_mut() {
            Some((writer, _)) => writer.append(data),
            None => Err(SyncError::Protocol("MIME data outside of a part".into())),
        }
    }

    fn finished_part(&mut self) -> SyncResult<()> {
        if let Some(json) = self.json.take() {
            self.document = Some(parse_document(&json)?);
            return Ok(());
        }
        let Some((mut writer, name)) = self.current.take() else {
            return Ok(());
        };
        writer.finish()?;
        let md5 = writer.md5_digest();
        if let Some(name) = name {
            self.by_name.insert(name, md5.clone());
        }
        self.by_digest.insert(md5, writer);
        Ok(())
    }
}
