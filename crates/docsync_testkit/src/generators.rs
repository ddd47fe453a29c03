//! Property-based test generators using proptest.
//!
//! Strategies for the identifiers and feed rows a replication sees.

use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for document IDs, excluding the reserved `_` prefix.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9_.-]{0,23}").expect("Invalid regex")
}

/// Strategy for revision IDs (`<generation>-<hex suffix>`).
pub fn rev_id_strategy() -> impl Strategy<Value = String> {
    (1u64..1000, prop::string::string_regex("[0-9a-f]{8,32}").expect("Invalid regex"))
        .prop_map(|(generation, suffix)| format!("{generation}-{suffix}"))
}

/// Strategy for feed sequences: integers, or Sync Gateway compound
/// strings such as `"12::3"`.
pub fn sequence_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0u64..1_000_000).prop_map(|n| json!(n)),
        (0u64..1000, 0u64..1000).prop_map(|(a, b)| json!(format!("{a}::{b}"))),
    ]
}

/// Strategy for one `_changes` row with one or two leaf revisions.
pub fn change_row_strategy() -> impl Strategy<Value = Value> {
    (
        sequence_strategy(),
        doc_id_strategy(),
        prop::collection::vec(rev_id_strategy(), 1..3),
        any::<bool>(),
    )
        .prop_map(|(seq, id, revs, deleted)| {
            let changes: Vec<Value> = revs.iter().map(|rev| json!({"rev": rev})).collect();
            let mut row = json!({"seq": seq, "id": id, "changes": changes});
            if deleted {
                row["deleted"] = Value::Bool(true);
            }
            row
        })
}

/// Strategy for a continuous feed body split at arbitrary points.
///
/// Yields the rows and the body chunks; joining the chunks gives the rows
/// as newline-separated JSON with heartbeat newlines in between.
pub fn chunked_feed_strategy() -> impl Strategy<Value = (Vec<Value>, Vec<Vec<u8>>)> {
    (
        prop::collection::vec(change_row_strategy(), 0..12),
        prop::collection::vec(1usize..64, 1..16),
    )
        .prop_map(|(rows, cuts)| {
            let mut body = Vec::new();
            for row in &rows {
                body.extend_from_slice(row.to_string().as_bytes());
                body.extend_from_slice(b"\n\n");
            }
            let mut chunks = Vec::new();
            let mut rest = body.as_slice();
            for cut in cuts.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (chunk, tail) = rest.split_at((*cut).min(rest.len()));
                chunks.push(chunk.to_vec());
                rest = tail;
            }
            (rows, chunks)
        })
}
