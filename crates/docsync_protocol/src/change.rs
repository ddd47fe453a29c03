//! Change-feed entries and delivery modes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::PendingRevision;
use serde_json::{Map, Value};

/// Delivery mode of the remote change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedMode {
    /// Single request returning everything since the last sequence.
    OneShot,
    /// Repeated requests that each block until at least one change exists.
    LongPoll,
    /// One long-lived connection streaming changes as they happen.
    Continuous,
}

impl FeedMode {
    /// Value of the `feed` query parameter for this mode.
    pub fn as_param(&self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Sequence of the change, rendered as a string.
    pub seq: String,
    /// Document ID the change belongs to.
    pub doc_id: Option<String>,
    /// Leaf revision IDs listed in `changes`.
    pub revs: Vec<String>,
    /// Whether the change is a deletion.
    pub deleted: bool,
}

impl ChangeEntry {
    /// Builds an entry from a decoded JSON object.
    ///
    /// The only hard requirement is a non-null `seq`.
    pub fn from_json(object: &Map<String, Value>) -> ProtocolResult<Self> {
        let seq = object
            .get("seq")
            .and_then(sequence_to_string)
            .ok_or(ProtocolError::MissingField("seq"))?;

        let doc_id = object.get("id").and_then(Value::as_str).map(str::to_owned);

        let revs = match object.get("changes") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.get("rev").and_then(Value::as_str))
                .map(str::to_owned)
                .collect(),
            Some(_) => {
                return Err(ProtocolError::UnexpectedJson(
                    "`changes` must be an array".into(),
                ))
            }
            None => Vec::new(),
        };

        let deleted = object
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            seq,
            doc_id,
            revs,
            deleted,
        })
    }

    /// Expands the entry into one pending revision per listed leaf.
    pub fn pending_revisions(&self) -> Vec<PendingRevision> {
        let Some(doc_id) = &self.doc_id else {
            return Vec::new();
        };
        self.revs
            .iter()
            .map(|rev| {
                PendingRevision::new(doc_id.clone(), rev.clone())
                    .with_deleted(self.deleted)
                    .with_sequence(self.seq.clone())
            })
            .collect()
    }
}

/// Renders a sequence value as the string used for checkpointing.
///
/// Strings are taken verbatim, numbers use their canonical rendering and
/// other non-null values fall back to compact JSON. `null` yields `None`.
pub fn sequence_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => serde_json::to_string(other).ok(),
    }
}
