//! Local document store collaborator.
//!
//! The replication engine does not own the local store's storage format. It
//! consumes a narrow interface: open checks, checkpoint persistence, revision
//! reads and writes, and attachment writers.

use crate::config::Direction;
use crate::error::{SyncError, SyncResult};
use docsync_protocol::PendingRevision;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Content-addressed sink for attachment bytes.
///
/// Digests are `md5-<base64>` and `sha1-<base64>` strings and are only
/// meaningful after [`finish`](BlobWriter::finish).
pub trait BlobWriter: Send + fmt::Debug {
    /// Appends bytes.
    fn append(&mut self, data: &[u8]) -> SyncResult<()>;

    /// Completes the blob.
    fn finish(&mut self) -> SyncResult<()>;

    /// Number of bytes written.
    fn length(&self) -> u64;

    /// MD5 digest of the written bytes.
    fn md5_digest(&self) -> String;

    /// SHA-1 digest of the written bytes.
    fn sha1_digest(&self) -> String;
}

/// Attachment writers keyed by MD5 digest.
pub type AttachmentWriters = BTreeMap<String, Box<dyn BlobWriter>>;

/// Interface the replication engine requires from the local store.
pub trait LocalStore: Send + Sync + fmt::Debug {
    /// Opens the store if it is not open yet.
    fn open_if_needed(&self) -> SyncResult<()>;

    /// Returns true if the store is open.
    fn is_open(&self) -> bool;

    /// Non-guessable identifier of this store, used in checkpoint IDs.
    fn private_identifier(&self) -> String;

    /// Last sequence recorded for a checkpoint.
    fn read_last_sequence(&self, checkpoint_id: &str, direction: Direction) -> SyncResult<Option<String>>;

    /// Records the last sequence for a checkpoint.
    fn write_last_sequence(&self, checkpoint_id: &str, direction: Direction, value: &str) -> SyncResult<()>;

    /// Creates a writer for an incoming attachment.
    fn attachment_writer(&self) -> SyncResult<Box<dyn BlobWriter>>;

    /// Takes ownership of parsed attachment writers for later installation.
    fn remember_attachment_writers(&self, writers: AttachmentWriters);

    /// Returns true if the revision is already stored.
    fn contains_revision(&self, doc_id: &str, rev_id: &str) -> SyncResult<bool>;

    /// Inserts a revision received from the remote.
    ///
    /// `body` carries `_id`, `_rev` and, when known, `_revisions`.
    fn put_revision(&self, body: Map<String, Value>) -> SyncResult<()>;

    /// Local revisions with a sequence greater than `since`, in sequence order.
    fn changes_since(&self, since: u64, limit: usize) -> SyncResult<Vec<PendingRevision>>;

    /// Body of a stored revision including its `_revisions` history.
    fn revision_body(&self, doc_id: &str, rev_id: &str) -> SyncResult<Option<Map<String, Value>>>;

    /// Watch channel carrying the store's latest sequence.
    fn observe_sequence(&self) -> watch::Receiver<u64>;
}

/// Revocable reference to the local store held by a session.
///
/// Once revoked, every access fails with [`SyncError::StoreClosed`]; tasks
/// still running after the session stopped fail locally instead of touching
/// the store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Option<Arc<dyn LocalStore>>>>,
}

impl StoreHandle {
    /// Wraps a store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(store))),
        }
    }

    /// Returns the store, or an error if access was revoked or the store
    /// was closed.
    pub fn get(&self) -> SyncResult<Arc<dyn LocalStore>> {
        let store = self.inner.read().clone().ok_or(SyncError::StoreClosed)?;
        if !store.is_open() {
            return Err(SyncError::StoreClosed);
        }
        Ok(store)
    }

    /// Returns the store even if it is closed, unless revoked.
    pub fn get_unchecked(&self) -> Option<Arc<dyn LocalStore>> {
        self.inner.read().clone()
    }

    /// Revokes access for every clone of this handle.
    pub fn revoke(&self) {
        self.inner.write().take();
    }

    /// Returns true once access was revoked.
    pub fn is_revoked(&self) -> bool {
        self.inner.read().is_none()
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
