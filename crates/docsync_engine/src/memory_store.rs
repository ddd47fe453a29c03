//! In-memory [`LocalStore`] for tests and embedders without persistence.

use crate::config::Direction;
use crate::error::{SyncError, SyncResult};
use crate::store::{AttachmentWriters, BlobWriter, LocalStore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use docsync_protocol::{generation_of, identity_of, is_deletion, PendingRevision};
use md5::Md5;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRevision {
    body: Map<String, Value>,
    history: Vec<String>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, BTreeMap<String, StoredRevision>>,
    by_sequence: BTreeMap<u64, (String, String)>,
    last_sequence: u64,
    checkpoints: BTreeMap<(String, Direction), String>,
    attachments: AttachmentWriters,
}

/// Document store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    private_id: String,
    open: AtomicBool,
    deleted: AtomicBool,
    inner: Mutex<Inner>,
    sequence: watch::Sender<u64>,
}

impl MemoryStore {
    /// Creates an open, empty store.
    pub fn new() -> Self {
        let (sequence, _) = watch::channel(0);
        Self {
            private_id: Uuid::new_v4().simple().to_string(),
            open: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
            sequence,
        }
    }

    /// Closes the store; sessions using it will fail with `StoreClosed`.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Closes the store for good: it can no longer be reopened.
    pub fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.close();
    }

    /// Creates a new local revision of `doc_id` on top of its current
    /// winning revision. Returns the new revision ID.
    pub fn create_revision(&self, doc_id: &str, mut body: Map<String, Value>) -> SyncResult<String> {
        self.check_open()?;
        let mut inner = self.inner.lock();

        let parent = inner
            .docs
            .get(doc_id)
            .and_then(winning)
            .map(|rev| rev.history.clone())
            .unwrap_or_default();
        let generation = parent.len() as u64 + 1;
        let rev_id = format!("{generation}-{}", Uuid::new_v4().simple());

        let mut history = vec![rev_id.clone()];
        history.extend(parent);

        body.insert("_id".into(), Value::String(doc_id.to_owned()));
        body.insert("_rev".into(), Value::String(rev_id.clone()));
        let deleted = is_deletion(&body);
        insert(&mut inner, doc_id, &rev_id, body, history, deleted);
        let seq = inner.last_sequence;
        drop(inner);

        self.sequence.send_replace(seq);
        Ok(rev_id)
    }

    /// Winning revision body of a document, or `None` if it is missing or
    /// deleted.
    pub fn document(&self, doc_id: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.lock();
        let rev = inner.docs.get(doc_id).and_then(winning)?;
        if rev.deleted {
            return None;
        }
        Some(rev.body.clone())
    }

    /// Number of stored revisions across all documents.
    pub fn revision_count(&self) -> usize {
        self.inner.lock().by_sequence.len()
    }

    /// Current local sequence.
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().last_sequence
    }

    /// Digests of attachments handed over by the replicator.
    pub fn pending_attachment_digests(&self) -> Vec<String> {
        self.inner.lock().attachments.keys().cloned().collect()
    }

    fn check_open(&self) -> SyncResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SyncError::StoreClosed)
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn winning(revs: &BTreeMap<String, StoredRevision>) -> Option<&StoredRevision> {
    revs.iter()
        .max_by_key(|(rev_id, _)| (generation_of(rev_id), rev_id.as_str()))
        .map(|(_, rev)| rev)
}

fn insert(
    inner: &mut Inner,
    doc_id: &str,
    rev_id: &str,
    body: Map<String, Value>,
    history: Vec<String>,
    deleted: bool,
) {
    inner.last_sequence += 1;
    let seq = inner.last_sequence;
    inner
        .by_sequence
        .insert(seq, (doc_id.to_owned(), rev_id.to_owned()));
    inner.docs.entry(doc_id.to_owned()).or_default().insert(
        rev_id.to_owned(),
        StoredRevision {
            body,
            history,
            deleted,
        },
    );
}

/// Reads a `_revisions` object into a list of full revision IDs, newest
/// first.
fn history_of(body: &Map<String, Value>, rev_id: &str) -> Vec<String> {
    let parsed = body.get("_revisions").and_then(|revisions| {
        let start = revisions.get("start")?.as_u64()?;
        let ids = revisions.get("ids")?.as_array()?;
        Some(
            ids.iter()
                .enumerate()
                .filter_map(|(i, suffix)| {
                    let generation = start.checked_sub(i as u64)?;
                    Some(format!("{generation}-{}", suffix.as_str()?))
                })
                .collect::<Vec<_>>(),
        )
    });
    match parsed {
        Some(history) if !history.is_empty() => history,
        _ => vec![rev_id.to_owned()],
    }
}

fn revisions_json(history: &[String]) -> Value {
    let start = history.first().and_then(|rev| generation_of(rev)).unwrap_or(0);
    let ids: Vec<Value> = history
        .iter()
        .filter_map(|rev| rev.split_once('-').map(|(_, suffix)| Value::String(suffix.to_owned())))
        .collect();
    json!({ "start": start, "ids": ids })
}

impl LocalStore for MemoryStore {
    fn open_if_needed(&self) -> SyncResult<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(SyncError::StoreClosed);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn private_identifier(&self) -> String {
        self.private_id.clone()
    }

    fn read_last_sequence(&self, checkpoint_id: &str, direction: Direction) -> SyncResult<Option<String>> {
        self.check_open()?;
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(&(checkpoint_id.to_owned(), direction))
            .cloned())
    }

    fn write_last_sequence(&self, checkpoint_id: &str, direction: Direction, value: &str) -> SyncResult<()> {
        self.check_open()?;
        self.inner
            .lock()
            .checkpoints
            .insert((checkpoint_id.to_owned(), direction), value.to_owned());
        Ok(())
    }

    fn attachment_writer(&self) -> SyncResult<Box<dyn BlobWriter>> {
        self.check_open()?;
        Ok(Box::new(MemoryBlobWriter::new()))
    }

    fn remember_attachment_writers(&self, writers: AttachmentWriters) {
        self.inner.lock().attachments.extend(writers);
    }

    fn contains_revision(&self, doc_id: &str, rev_id: &str) -> SyncResult<bool> {
        self.check_open()?;
        Ok(self
            .inner
            .lock()
            .docs
            .get(doc_id)
            .is_some_and(|revs| revs.contains_key(rev_id)))
    }

    fn put_revision(&self, mut body: Map<String, Value>) -> SyncResult<()> {
        self.check_open()?;
        let (doc_id, rev_id) = identity_of(&body)
            .map(|(id, rev)| (id.to_owned(), rev.to_owned()))
            .ok_or_else(|| SyncError::Store("revision body lacks `_id` or `_rev`".into()))?;

        let mut inner = self.inner.lock();
        if inner
            .docs
            .get(&doc_id)
            .is_some_and(|revs| revs.contains_key(&rev_id))
        {
            return Ok(());
        }
        let history = history_of(&body, &rev_id);
        body.remove("_revisions");
        let deleted = is_deletion(&body);
        insert(&mut inner, &doc_id, &rev_id, body, history, deleted);
        let seq = inner.last_sequence;
        drop(inner);

        self.sequence.send_replace(seq);
        Ok(())
    }

    fn changes_since(&self, since: u64, limit: usize) -> SyncResult<Vec<PendingRevision>> {
        self.check_open()?;
        let inner = self.inner.lock();
        Ok(inner
            .by_sequence
            .range(since.saturating_add(1)..)
            .take(limit)
            .map(|(seq, (doc_id, rev_id))| {
                let deleted = inner
                    .docs
                    .get(doc_id)
                    .and_then(|revs| revs.get(rev_id))
                    .is_some_and(|rev| rev.deleted);
                PendingRevision::new(doc_id.clone(), rev_id.clone())
                    .with_deleted(deleted)
                    .with_sequence(seq.to_string())
            })
            .collect())
    }

    fn revision_body(&self, doc_id: &str, rev_id: &str) -> SyncResult<Option<Map<String, Value>>> {
        self.check_open()?;
        let inner = self.inner.lock();
        let Some(rev) = inner.docs.get(doc_id).and_then(|revs| revs.get(rev_id)) else {
            return Ok(None);
        };
        let mut body = rev.body.clone();
        body.insert("_revisions".into(), revisions_json(&rev.history));
        Ok(Some(body))
    }

    fn observe_sequence(&self) -> watch::Receiver<u64> {
        self.sequence.subscribe()
    }
}

/// Attachment writer buffering bytes in memory while hashing them.
pub struct MemoryBlobWriter {
    data: Vec<u8>,
    md5: Md5,
    sha1: Sha1,
    digests: Option<(String, String)>,
}

impl MemoryBlobWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            md5: Md5::new(),
            sha1: Sha1::new(),
            digests: None,
        }
    }

    /// The bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn compute(&self) -> (String, String) {
        let md5 = format!("md5-{}", STANDARD.encode(self.md5.clone().finalize()));
        let sha1 = format!("sha1-{}", STANDARD.encode(self.sha1.clone().finalize()));
        (md5, sha1)
    }
}

impl Default for MemoryBlobWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBlobWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlobWriter")
            .field("length", &self.data.len())
            .field("finished", &self.digests.is_some())
            .finish()
    }
}

impl BlobWriter for MemoryBlobWriter {
    fn append(&mut self, data: &[u8]) -> SyncResult<()> {
        if self.digests.is_some() {
            return Err(SyncError::Store("attachment writer already finished".into()));
        }
        self.md5.update(data);
        self.sha1.update(data);
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> SyncResult<()> {
        if self.digests.is_none() {
            self.digests = Some(self.compute());
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn md5_digest(&self) -> String {
        match &self.digests {
            Some((md5, _)) => md5.clone(),
            None => self.compute().0,
        }
    }

    fn sha1_digest(&self) -> String {
        match &self.digests {
            Some((_, sha1)) => sha1.clone(),
            None => self.compute().1,
        }
    }
}
