//! Checkpoint identifiers and checkpoint document bodies.
//!
//! The checkpoint identifier is the only key correlating independent client
//! instances with the checkpoint document stored on the remote, so it must be
//! a pure function of the replication's defining parameters.

use crate::change::sequence_to_string;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Key of the last synced sequence inside a checkpoint document.
pub const LAST_SEQUENCE_KEY: &str = "lastSequence";

/// The parameters that define a replication for checkpointing purposes.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSpec {
    /// Private (non-guessable) identifier of the local store.
    pub local_uuid: String,
    /// Remote endpoint URL.
    pub remote_url: String,
    /// True for push replications.
    pub push: bool,
    /// True for continuous replications.
    pub continuous: bool,
    /// Filter function name.
    pub filter: Option<String>,
    /// Filter parameters.
    pub filter_params: Option<BTreeMap<String, Value>>,
    /// Explicit document-ID allowlist.
    pub doc_ids: Option<Vec<String>>,
}

impl CheckpointSpec {
    /// Creates a spec without filter or document restrictions.
    pub fn new(local_uuid: impl Into<String>, remote_url: impl Into<String>, push: bool) -> Self {
        Self {
            local_uuid: local_uuid.into(),
            remote_url: remote_url.into(),
            push,
            continuous: false,
            filter: None,
            filter_params: None,
            doc_ids: None,
        }
    }

    /// Builds the canonical JSON object that is hashed.
    ///
    /// `serde_json::Map` keeps keys sorted, so nested filter parameter
    /// objects are canonical as well.
    pub fn canonical_json(&self) -> Value {
        let mut spec = Map::new();
        spec.insert("localUUID".into(), Value::String(self.local_uuid.clone()));
        spec.insert("remoteURL".into(), Value::String(self.remote_url.clone()));
        spec.insert("push".into(), Value::Bool(self.push));
        spec.insert("continuous".into(), Value::Bool(self.continuous));
        if let Some(filter) = &self.filter {
            spec.insert("filter".into(), Value::String(filter.clone()));
        }
        if let Some(params) = &self.filter_params {
            let params: Map<String, Value> = params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            spec.insert("filterParams".into(), Value::Object(params));
        }
        if let Some(doc_ids) = &self.doc_ids {
            let mut sorted = doc_ids.clone();
            sorted.sort();
            spec.insert(
                "docids".into(),
                Value::Array(sorted.into_iter().map(Value::String).collect()),
            );
        }
        Value::Object(spec)
    }

    /// Lowercase hex SHA-1 of the canonical JSON rendering.
    pub fn checkpoint_id(&self) -> String {
        let bytes = self.canonical_json().to_string();
        let digest = Sha1::digest(bytes.as_bytes());
        hex::encode(digest)
    }
}

/// Reads the recorded last sequence from a checkpoint document.
pub fn last_sequence_of(checkpoint: &Map<String, Value>) -> Option<String> {
    checkpoint.get(LAST_SEQUENCE_KEY).and_then(sequence_to_string)
}

/// Builds the body for a checkpoint save: the previous remote contents
/// with `lastSequence` replaced.
pub fn checkpoint_body(previous: Option<&Map<String, Value>>, last_sequence: &str) -> Map<String, Value> {
    let mut body = previous.cloned().unwrap_or_default();
    body.insert(
        LAST_SEQUENCE_KEY.into(),
        Value::String(last_sequence.to_owned()),
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn base() -> CheckpointSpec {
        CheckpointSpec::new("c0ffee", "http://example.com/db", false)
    }

    #[test]
    fn id_is_lowercase_sha1_hex() {
        let id = base().checkpoint_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn canonical_json_layout() {
        let mut spec = base();
        spec.filter = Some("app/by_owner".into());
        spec.doc_ids = Some(vec!["b".into(), "a".into()]);
        assert_eq!(
            spec.canonical_json().to_string(),
            r#"{"continuous":false,"docids":["a","b"],"filter":"app/by_owner","localUUID":"c0ffee","push":false,"remoteURL":"http://example.com/db"}"#
        );
    }

    #[test]
    fn direction_and_mode_change_the_id() {
        let pull = base();
        let mut push = base();
        push.push = true;
        let mut continuous = base();
        continuous.continuous = true;
        assert_ne!(pull.checkpoint_id(), push.checkpoint_id());
        assert_ne!(pull.checkpoint_id(), continuous.checkpoint_id());
    }

    #[test]
    fn body_merges_previous_contents() {
        let previous = json!({"_rev": "0-3", "lastSequence": "4", "extra": 1});
        let body = checkpoint_body(previous.as_object(), "9");
        assert_eq!(body["_rev"], "0-3");
        assert_eq!(body["extra"], 1);
        assert_eq!(last_sequence_of(&body).as_deref(), Some("9"));
        assert_eq!(last_sequence_of(&Map::new()), None);
    }

    proptest! {
        #[test]
        fn id_ignores_param_and_doc_id_order(
            params in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..6),
            ids in proptest::collection::vec("[a-z0-9]{1,8}", 0..8),
            seed in any::<u64>(),
        ) {
            let pairs: Vec<(String, String)> = params.into_iter().collect();
            let mut reversed = pairs.clone();
            reversed.reverse();

            let mut shuffled_ids = ids.clone();
            if !shuffled_ids.is_empty() {
                let len = shuffled_ids.len();
                shuffled_ids.rotate_left((seed as usize) % len);
            }

            let mut a = base();
            a.filter = Some("f".into());
            a.filter_params = Some(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect());
            a.doc_ids = Some(ids);

            let mut b = base();
            b.filter = Some("f".into());
            b.filter_params = Some(reversed.into_iter().map(|(k, v)| (k, Value::String(v))).collect());
            b.doc_ids = Some(shuffled_ids);

            prop_assert_eq!(a.checkpoint_id(), b.checkpoint_id());
        }
    }
}
