//! Pull transfer: remote change feed in, revisions fetched and stored.

use super::{Actor, Command, Shared};
use crate::error::{SyncError, SyncResult};
use crate::http::Method;
use crate::multipart::MultipartDocumentReader;
use crate::tracker::{ChangeTracker, ChangeTrackerClient, TrackerOptions};
use docsync_protocol::{ChangeEntry, PendingRevision};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Forwards tracker callbacks to the session queue.
struct FeedSink {
    shared: Arc<Shared>,
    handle: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
}

impl FeedSink {
    fn post(&self, command: Command) {
        if let Some(tx) = self.handle.upgrade() {
            let _ = tx.send(command);
        }
    }
}

impl ChangeTrackerClient for FeedSink {
    fn received_changes(&self, changes: Vec<ChangeEntry>) {
        self.post(Command::Changes(self.generation, changes));
    }

    fn tracker_stopped(&self, error: Option<SyncError>) {
        self.post(Command::TrackerStopped(self.generation, error));
    }

    fn response_received(&self, server: Option<&str>) {
        self.shared.note_server(server);
    }

    fn caught_up(&self) {
        self.post(Command::CaughtUp(self.generation));
    }
}

impl Actor {
    pub(super) fn start_pull(&mut self) {
        self.stop_sources();
        let config = &self.shared.config;
        let options = TrackerOptions::default()
            .with_since(self.last_sequence())
            .with_filter(config.filter.clone(), config.filter_params.clone())
            .with_headers(config.headers.clone())
            .with_authenticator(self.authenticator.clone())
            .with_feed(config.feed.clone())
            .with_backoff(config.backoff);
        let sink = FeedSink {
            shared: self.shared.clone(),
            handle: self.handle.clone(),
            generation: self.generation,
        };

        match ChangeTracker::new(self.http.clone(), &config.remote, config.feed_mode(), options, Arc::new(sink)) {
            Ok(tracker) => {
                debug!(session = %self.shared.id, mode = ?tracker.mode(), since = ?self.last_sequence(), "starting change tracker");
                tracker.start();
                self.tracker = Some(tracker);
            }
            Err(err) => {
                self.set_error(err);
                self.defer(crate::state::ReplicationTrigger::StopImmediate);
            }
        }
    }

    pub(super) fn received_changes(&mut self, changes: Vec<ChangeEntry>) {
        if let Some(last) = changes.last() {
            self.source_sequence = Some(last.seq.clone());
        }
        let revisions: Vec<PendingRevision> = changes.iter().flat_map(ChangeEntry::pending_revisions).collect();
        trace!(session = %self.shared.id, changes = changes.len(), revisions = revisions.len(), "received changes");
        self.queue_revisions(revisions);
    }

    /// The remote has nothing more right now; a drained continuous pull
    /// goes idle.
    pub(super) fn feed_caught_up(&mut self) {
        trace!(session = %self.shared.id, "change feed caught up");
        self.check_completion();
    }

    pub(super) fn tracker_stopped(&mut self, error: Option<SyncError>) {
        self.tracker = None;
        self.source_exhausted = true;
        match error {
            Some(err) => {
                self.set_error(err);
                self.defer(crate::state::ReplicationTrigger::StopGraceful);
            }
            None => {
                debug!(session = %self.shared.id, "change feed finished");
                self.check_completion();
            }
        }
    }

    /// Fetches the revisions of a batch the store does not have yet.
    ///
    /// The batch finishes when the last fetch completes.
    pub(super) fn process_pull_batch(&mut self, id: u64, batch: Vec<PendingRevision>) {
        let store = match self.store.get() {
            Ok(store) => store,
            Err(err) => {
                let size = batch.len();
                for revision in &batch {
                    self.record_revision_failure(revision, err.clone());
                }
                self.add_completed_changes_count(size);
                return self.finish_batch(id);
            }
        };

        let mut present = 0;
        let mut outstanding = 0;
        for revision in batch {
            match store.contains_revision(&revision.doc_id, &revision.rev_id) {
                Ok(true) => {
                    present += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    self.record_revision_failure(&revision, err);
                    present += 1;
                    continue;
                }
            }

            let request = match self.request(Method::Get, &[&revision.doc_id]) {
                Ok(mut request) => {
                    request
                        .url
                        .query_pairs_mut()
                        .append_pair("rev", &revision.rev_id)
                        .append_pair("revs", "true")
                        .append_pair("attachments", "true");
                    request.with_header("Accept", "multipart/related, application/json")
                }
                Err(err) => {
                    self.record_revision_failure(&revision, err);
                    present += 1;
                    continue;
                }
            };

            outstanding += 1;
            let http = self.http.clone();
            let shared = self.shared.clone();
            let handle = self.store.clone();
            self.spawn_request(
                async move {
                    let response = http.send(request).await?;
                    shared.note_server(response.header("server"));
                    let response = response.error_for_status().await?;
                    MultipartDocumentReader::read_response(response, handle.get()?).await
                },
                move |actor, result| actor.revision_fetched(id, revision, result),
            );
        }

        if present > 0 {
            self.add_completed_changes_count(present);
        }
        if outstanding == 0 {
            self.finish_batch(id);
        } else if let Some(progress) = self.batches.get_mut(&id) {
            progress.outstanding = outstanding;
        }
    }

    fn revision_fetched(&mut self, id: u64, revision: PendingRevision, result: SyncResult<Map<String, Value>>) {
        let stored = result.and_then(|body| self.store.get()?.put_revision(body));
        match stored {
            Ok(()) => trace!(session = %self.shared.id, doc = %revision.doc_id, rev = %revision.rev_id, "stored revision"),
            Err(err) => self.record_revision_failure(&revision, err),
        }
        self.add_completed_changes_count(1);

        let finished = match self.batches.get_mut(&id) {
            Some(progress) => {
                progress.outstanding = progress.outstanding.saturating_sub(1);
                progress.outstanding == 0
            }
            None => false,
        };
        if finished {
            self.finish_batch(id);
        }
    }
}
