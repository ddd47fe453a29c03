//! Checkpoint bookkeeping.
//!
//! [`CheckpointState`] holds the cached remote checkpoint document and
//! decides when a save is issued. At most one save is in flight; a request
//! made during a save marks the checkpoint overdue and is re-issued when the
//! save completes, carrying the sequence current at that moment.

use docsync_protocol::checkpoint_body;
use serde_json::{Map, Value};

/// A save the session must send as `PUT _local/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// Checkpoint document ID.
    pub checkpoint_id: String,
    /// Document body, including the current `_rev` if known.
    pub body: Map<String, Value>,
    /// The sequence being saved.
    pub last_sequence: String,
}

/// What the session must do after a checkpoint event.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveAction {
    /// Nothing to do.
    None,
    /// A save is in flight; the request was recorded as overdue.
    Deferred,
    /// Send this save.
    Save(SaveRequest),
    /// Re-fetch the remote checkpoint, then call
    /// [`CheckpointState::refreshed`].
    Refresh,
}

/// Result of a checkpoint `PUT`.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Stored; carries the new revision marker.
    Saved {
        /// Revision returned by the remote.
        rev: String,
    },
    /// Revision mismatch (409).
    Conflict,
    /// The checkpoint document or database is gone (404).
    NotFound,
    /// Any other failure; left for the next save trigger.
    Failed,
}

/// Result of re-fetching the remote checkpoint after a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The remote's current checkpoint document.
    Found(Map<String, Value>),
    /// The remote has no checkpoint document (404).
    NotFound,
    /// The fetch failed; the cached document is kept.
    Failed,
}

/// Per-session checkpoint state.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    id: String,
    remote: Option<Map<String, Value>>,
    in_flight: Option<SaveRequest>,
    refreshing: bool,
    overdue: bool,
    last_saved: Option<String>,
}

impl CheckpointState {
    /// Creates the state for a checkpoint ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote: None,
            in_flight: None,
            refreshing: false,
            overdue: false,
            last_saved: None,
        }
    }

    /// Checkpoint document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cached remote checkpoint document.
    pub fn remote(&self) -> Option<&Map<String, Value>> {
        self.remote.as_ref()
    }

    /// Replaces the cached remote checkpoint (after a fetch).
    pub fn set_remote(&mut self, remote: Option<Map<String, Value>>) {
        self.remote = remote;
    }

    /// Sequence of the last successful save.
    pub fn last_saved(&self) -> Option<&str> {
        self.last_saved.as_deref()
    }

    /// Records the sequence both sides already agree on, so resuming does
    /// not save it again.
    pub fn set_last_saved(&mut self, sequence: Option<String>) {
        self.last_saved = sequence;
    }

    /// True while a save (or the refresh after a conflict) is in flight.
    pub fn is_saving(&self) -> bool {
        self.in_flight.is_some() || self.refreshing
    }

    /// True if a save was requested while one was in flight.
    pub fn is_overdue(&self) -> bool {
        self.overdue
    }

    /// Requests a save of `current`.
    pub fn request_save(&mut self, current: Option<&str>) -> SaveAction {
        if self.is_saving() {
            self.overdue = true;
            return SaveAction::Deferred;
        }
        let Some(current) = current else {
            return SaveAction::None;
        };
        if self.last_saved.as_deref() == Some(current) {
            return SaveAction::None;
        }

        let request = SaveRequest {
            checkpoint_id: self.id.clone(),
            body: checkpoint_body(self.remote.as_ref(), current),
            last_sequence: current.to_owned(),
        };
        self.in_flight = Some(request.clone());
        SaveAction::Save(request)
    }

    /// Applies the outcome of the in-flight save.
    ///
    /// `current` is the session's last sequence now; it is what an overdue
    /// save carries.
    pub fn save_finished(&mut self, outcome: SaveOutcome, current: Option<&str>) -> SaveAction {
        let Some(request) = self.in_flight.take() else {
            return SaveAction::None;
        };

        match outcome {
            SaveOutcome::Saved { rev } => {
                let mut body = request.body;
                body.insert("_rev".into(), Value::String(rev));
                self.remote = Some(body);
                self.last_saved = Some(request.last_sequence);
            }
            SaveOutcome::Conflict => {
                self.refreshing = true;
                return SaveAction::Refresh;
            }
            SaveOutcome::NotFound => {
                self.remote = None;
            }
            SaveOutcome::Failed => {}
        }

        self.reissue_if_overdue(current)
    }

    /// Completes the refresh after a conflict.
    ///
    /// The save is retried only when the refresh learned the remote's
    /// state; after a failed refresh the next save trigger retries.
    pub fn refreshed(&mut self, outcome: RefreshOutcome, current: Option<&str>) -> SaveAction {
        if !self.refreshing {
            return SaveAction::None;
        }
        self.refreshing = false;
        self.overdue = false;
        match outcome {
            RefreshOutcome::Found(remote) => self.remote = Some(remote),
            RefreshOutcome::NotFound => self.remote = None,
            RefreshOutcome::Failed => return SaveAction::None,
        }
        self.request_save(current)
    }

    fn reissue_if_overdue(&mut self, current: Option<&str>) -> SaveAction {
        if !self.overdue {
            return SaveAction::None;
        }
        self.overdue = false;
        self.request_save(current)
    }
}

/// Chooses the sequence to resume from.
///
/// The remote and local records are trusted only if they agree exactly;
/// anything else means replicating from the beginning.
pub fn agreed_sequence(remote: Option<&str>, local: Option<&str>) -> Option<String> {
    match (remote, local) {
        (Some(remote), Some(local)) if remote == local => Some(remote.to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::LAST_SEQUENCE_KEY;

    fn expect_save(action: SaveAction) -> SaveRequest {
        match action {
            SaveAction::Save(request) => request,
            other => panic!("expected a save, got {other:?}"),
        }
    }

    #[test]
    fn overdue_save_carries_latest_sequence() {
        let mut state = CheckpointState::new("cp");
        let first = expect_save(state.request_save(Some("1")));
        assert_eq!(first.last_sequence, "1");
        assert!(state.is_saving());

        assert_eq!(state.request_save(Some("2")), SaveAction::Deferred);
        assert_eq!(state.request_save(Some("3")), SaveAction::Deferred);
        assert!(state.is_overdue());

        // The sequence moved on to 4 by the time the first save finished.
        let action = state.save_finished(SaveOutcome::Saved { rev: "0-1".into() }, Some("4"));
        let second = expect_save(action);
        assert_eq!(second.last_sequence, "4");
        assert_eq!(second.body["_rev"], "0-1");
        assert_eq!(second.body[LAST_SEQUENCE_KEY], "4");
        assert!(!state.is_overdue());

        // Exactly one additional save: finishing it issues nothing more.
        let done = state.save_finished(SaveOutcome::Saved { rev: "0-2".into() }, Some("4"));
        assert_eq!(done, SaveAction::None);
        assert_eq!(state.last_saved(), Some("4"));
        assert_eq!(state.remote().unwrap()["_rev"], "0-2");
    }

    #[test]
    fn unchanged_sequence_is_not_saved_again() {
        let mut state = CheckpointState::new("cp");
        expect_save(state.request_save(Some("5")));
        state.save_finished(SaveOutcome::Saved { rev: "0-1".into() }, Some("5"));
        assert_eq!(state.request_save(Some("5")), SaveAction::None);
        assert_eq!(state.request_save(None), SaveAction::None);
    }

    #[test]
    fn resumed_sequence_is_not_saved_again() {
        let mut state = CheckpointState::new("cp");
        state.set_last_saved(Some("12".into()));
        assert_eq!(state.request_save(Some("12")), SaveAction::None);
        assert_eq!(expect_save(state.request_save(Some("13"))).last_sequence, "13");
    }

    #[test]
    fn conflict_refreshes_then_saves() {
        let mut state = CheckpointState::new("cp");
        expect_save(state.request_save(Some("1")));
        assert_eq!(state.save_finished(SaveOutcome::Conflict, Some("1")), SaveAction::Refresh);
        assert!(state.is_saving());
        assert_eq!(state.request_save(Some("2")), SaveAction::Deferred);

        let mut remote = Map::new();
        remote.insert("_rev".into(), Value::String("0-7".into()));
        remote.insert(LAST_SEQUENCE_KEY.into(), Value::String("0".into()));
        let retry = expect_save(state.refreshed(RefreshOutcome::Found(remote), Some("2")));
        assert_eq!(retry.body["_rev"], "0-7");
        assert_eq!(retry.last_sequence, "2");
    }

    #[test]
    fn missing_checkpoint_after_conflict_is_recreated() {
        let mut state = CheckpointState::new("cp");
        let mut remote = Map::new();
        remote.insert("_rev".into(), Value::String("0-3".into()));
        state.set_remote(Some(remote));

        expect_save(state.request_save(Some("4")));
        assert_eq!(state.save_finished(SaveOutcome::Conflict, Some("4")), SaveAction::Refresh);
        let retry = expect_save(state.refreshed(RefreshOutcome::NotFound, Some("4")));
        assert!(!retry.body.contains_key("_rev"));
    }

    #[test]
    fn failed_refresh_keeps_cache_and_waits_for_next_trigger() {
        let mut state = CheckpointState::new("cp");
        let mut remote = Map::new();
        remote.insert("_rev".into(), Value::String("0-3".into()));
        state.set_remote(Some(remote));

        expect_save(state.request_save(Some("4")));
        assert_eq!(state.save_finished(SaveOutcome::Conflict, Some("4")), SaveAction::Refresh);
        assert_eq!(state.request_save(Some("5")), SaveAction::Deferred);

        assert_eq!(state.refreshed(RefreshOutcome::Failed, Some("5")), SaveAction::None);
        assert!(!state.is_saving());
        assert!(!state.is_overdue());
        assert_eq!(state.remote().unwrap()["_rev"], "0-3");

        let next = expect_save(state.request_save(Some("5")));
        assert_eq!(next.body["_rev"], "0-3");
    }

    #[test]
    fn not_found_clears_cached_checkpoint() {
        let mut state = CheckpointState::new("cp");
        let mut remote = Map::new();
        remote.insert("_rev".into(), Value::String("0-3".into()));
        state.set_remote(Some(remote));

        let request = expect_save(state.request_save(Some("9")));
        assert_eq!(request.body["_rev"], "0-3");
        assert_eq!(state.save_finished(SaveOutcome::NotFound, Some("9")), SaveAction::None);
        assert!(state.remote().is_none());

        let next = expect_save(state.request_save(Some("9")));
        assert!(!next.body.contains_key("_rev"));
    }

    #[test]
    fn failure_is_retried_only_on_next_trigger() {
        let mut state = CheckpointState::new("cp");
        expect_save(state.request_save(Some("1")));
        assert_eq!(state.save_finished(SaveOutcome::Failed, Some("1")), SaveAction::None);
        assert!(!state.is_saving());
        expect_save(state.request_save(Some("1")));
    }

    #[test]
    fn resume_requires_agreement() {
        assert_eq!(agreed_sequence(Some("7"), Some("7")).as_deref(), Some("7"));
        assert_eq!(agreed_sequence(Some("7"), Some("6")), None);
        assert_eq!(agreed_sequence(None, Some("6")), None);
        assert_eq!(agreed_sequence(Some("7"), None), None);
    }
}
