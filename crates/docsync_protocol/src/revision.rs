//! Revision identifiers queued for transfer.

use serde_json::{Map, Value};

/// A revision waiting to be transferred.
///
/// Carries only the identifying metadata; the document body is fetched
/// (pull) or read from the local store (push) when the batch is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRevision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID (`<generation>-<suffix>`).
    pub rev_id: String,
    /// Whether this revision is a deletion marker.
    pub deleted: bool,
    /// Sequence the revision was reported under, if known.
    pub sequence: Option<String>,
}

impl PendingRevision {
    /// Creates a pending revision.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted: false,
            sequence: None,
        }
    }

    /// Marks the revision as a deletion.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Sets the sequence the revision was reported under.
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Returns the generation number encoded in the revision ID.
    pub fn generation(&self) -> Option<u64> {
        generation_of(&self.rev_id)
    }
}

/// Parses the generation prefix of a revision ID such as `3-abc`.
pub fn generation_of(rev_id: &str) -> Option<u64> {
    let (prefix, suffix) = rev_id.split_once('-')?;
    if suffix.is_empty() {
        return None;
    }
    prefix.parse().ok()
}

/// Reads `_id` and `_rev` from a document body.
pub fn identity_of(body: &Map<String, Value>) -> Option<(&str, &str)> {
    let id = body.get("_id")?.as_str()?;
    let rev = body.get("_rev")?.as_str()?;
    Some((id, rev))
}

/// Returns true if the body carries `"_deleted": true`.
pub fn is_deletion(body: &Map<String, Value>) -> bool {
    body.get("_deleted").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generation_parsing() {
        assert_eq!(generation_of("1-abc"), Some(1));
        assert_eq!(generation_of("42-x"), Some(42));
        assert_eq!(generation_of("abc"), None);
        assert_eq!(generation_of("x-abc"), None);
        assert_eq!(generation_of("3-"), None);
    }

    #[test]
    fn pending_revision_builder() {
        let rev = PendingRevision::new("doc1", "2-b")
            .with_deleted(true)
            .with_sequence("17");
        assert_eq!(rev.generation(), Some(2));
        assert!(rev.deleted);
        assert_eq!(rev.sequence.as_deref(), Some("17"));
    }

    #[test]
    fn body_identity() {
        let body = json!({"_id": "a", "_rev": "1-x", "_deleted": true});
        let map = body.as_object().unwrap();
        assert_eq!(identity_of(map), Some(("a", "1-x")));
        assert!(is_deletion(map));

        let plain = json!({"_id": "a"});
        assert_eq!(identity_of(plain.as_object().unwrap()), None);
        assert!(!is_deletion(plain.as_object().unwrap()));
    }
}
