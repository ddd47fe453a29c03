//! Push transfer: local changes out through `_revs_diff` and `_bulk_docs`.

use super::{Actor, Command};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpRequest, Method};
use crate::state::ReplicationTrigger;
use docsync_protocol::{BulkDocsItem, BulkDocsRequest, PendingRevision, RevsDiffRequest, RevsDiffResponse};
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace};

/// Local changes read per page.
const CHANGES_PAGE: usize = 500;

impl Actor {
    pub(super) fn start_push(&mut self) {
        self.stop_sources();
        let store = match self.store.get() {
            Ok(store) => store,
            Err(err) => {
                self.set_error(err);
                return self.defer(ReplicationTrigger::StopImmediate);
            }
        };

        self.push_cursor = self
            .last_sequence()
            .and_then(|seq| seq.parse().ok())
            .unwrap_or(0);
        debug!(session = %self.shared.id, since = self.push_cursor, "pushing local changes");
        self.queue_local_changes();

        if self.shared.config.continuous {
            let mut sequence = store.observe_sequence();
            let handle = self.handle.clone();
            let generation = self.generation;
            self.push_observer = Some(tokio::spawn(async move {
                while sequence.changed().await.is_ok() {
                    let Some(tx) = handle.upgrade() else {
                        break;
                    };
                    if tx.send(Command::LocalChanged(generation)).is_err() {
                        break;
                    }
                }
            }));
        }

        self.source_exhausted = true;
        self.check_completion();
    }

    /// Queues every local revision after the push cursor.
    pub(super) fn queue_local_changes(&mut self) {
        loop {
            let page = match self.store.get().and_then(|s| s.changes_since(self.push_cursor, CHANGES_PAGE)) {
                Ok(page) => page,
                Err(err) => {
                    self.set_error(err);
                    return self.defer(ReplicationTrigger::StopGraceful);
                }
            };
            let full = page.len() == CHANGES_PAGE;
            if let Some(last) = page.iter().filter_map(|r| r.sequence.as_deref()?.parse::<u64>().ok()).max() {
                self.push_cursor = self.push_cursor.max(last);
            }
            if page.is_empty() {
                return;
            }
            self.source_sequence = Some(self.push_cursor.to_string());
            trace!(session = %self.shared.id, revisions = page.len(), cursor = self.push_cursor, "local changes");
            self.queue_revisions(page);
            if !full {
                return;
            }
        }
    }

    /// Asks the remote which revisions of a batch it lacks, then uploads
    /// those verbatim.
    pub(super) fn process_push_batch(&mut self, id: u64, batch: Vec<PendingRevision>) {
        let mut diff = RevsDiffRequest::new();
        for revision in &batch {
            diff.entry(revision.doc_id.clone()).or_default().push(revision.rev_id.clone());
        }
        let body = match serde_json::to_value(&diff) {
            Ok(body) => body,
            Err(err) => return self.push_batch_failed(id, &batch, err.into()),
        };
        match self.request(Method::Post, &["_revs_diff"]) {
            Ok(request) => {
                let request = with_json_body(request, &body);
                self.send(request, move |actor, result| actor.revs_diffed(id, batch, result));
            }
            Err(err) => self.push_batch_failed(id, &batch, err),
        }
    }

    fn revs_diffed(&mut self, id: u64, batch: Vec<PendingRevision>, result: SyncResult<Value>) {
        let diff = result.and_then(|body| match body {
            Value::Null => Ok(RevsDiffResponse::new()),
            body => Ok(serde_json::from_value::<RevsDiffResponse>(body)?),
        });
        let diff = match diff {
            Ok(diff) => diff,
            Err(err) => return self.push_batch_failed(id, &batch, err),
        };

        let store = match self.store.get() {
            Ok(store) => store,
            Err(err) => return self.push_batch_failed(id, &batch, err),
        };
        let mut docs = Vec::new();
        let mut uploading = Vec::new();
        for revision in &batch {
            let missing = diff
                .get(&revision.doc_id)
                .is_some_and(|entry| entry.missing.contains(&revision.rev_id));
            if !missing {
                continue;
            }
            match store.revision_body(&revision.doc_id, &revision.rev_id) {
                Ok(Some(body)) => {
                    docs.push(body);
                    uploading.push(revision.clone());
                }
                Ok(None) => debug!(session = %self.shared.id, doc = %revision.doc_id, rev = %revision.rev_id, "revision no longer stored"),
                Err(err) => self.record_revision_failure(revision, err),
            }
        }

        if docs.is_empty() {
            trace!(session = %self.shared.id, batch = id, "remote has every revision");
            self.add_completed_changes_count(batch.len());
            return self.finish_batch(id);
        }

        let body = BulkDocsRequest { docs, new_edits: false };
        let body = match serde_json::to_value(&body) {
            Ok(body) => body,
            Err(err) => return self.push_batch_failed(id, &batch, err.into()),
        };
        match self.request(Method::Post, &["_bulk_docs"]) {
            Ok(request) => {
                let request = with_json_body(request, &body);
                let size = batch.len();
                self.send(request, move |actor, result| actor.bulk_docs_done(id, size, uploading, result));
            }
            Err(err) => self.push_batch_failed(id, &uploading, err),
        }
    }

    fn bulk_docs_done(&mut self, id: u64, size: usize, uploaded: Vec<PendingRevision>, result: SyncResult<Value>) {
        let items = result.and_then(|body| match body {
            Value::Null => Ok(Vec::new()),
            body => Ok(serde_json::from_value::<Vec<BulkDocsItem>>(body)?),
        });
        match items {
            Ok(items) => {
                for item in items {
                    let Some(status) = item.error_status() else {
                        continue;
                    };
                    let revision = uploaded
                        .iter()
                        .find(|r| Some(r.doc_id.as_str()) == item.id.as_deref())
                        .cloned()
                        .unwrap_or_else(|| {
                            PendingRevision::new(item.id.clone().unwrap_or_default(), item.rev.clone().unwrap_or_default())
                        });
                    let reason = item.reason.or(item.error).unwrap_or_default();
                    self.record_revision_failure(&revision, SyncError::http(status, reason));
                }
                debug!(session = %self.shared.id, batch = id, uploaded = uploaded.len(), "pushed revisions");
            }
            Err(err) => {
                for revision in &uploaded {
                    self.record_revision_failure(revision, err.clone());
                }
            }
        }
        self.add_completed_changes_count(size);
        self.finish_batch(id);
    }

    fn push_batch_failed(&mut self, id: u64, batch: &[PendingRevision], err: SyncError) {
        for revision in batch {
            self.record_revision_failure(revision, err.clone());
        }
        let size = self.batches.get(&id).map_or(batch.len(), |b| b.size);
        self.add_completed_changes_count(size);
        self.finish_batch(id);
    }
}

fn with_json_body(request: HttpRequest, body: &Value) -> HttpRequest {
    request
        .with_header("Content-Type", "application/json")
        .with_body(Bytes::from(body.to_string()))
}
