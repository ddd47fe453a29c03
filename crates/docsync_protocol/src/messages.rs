//! Request and response bodies of the remote REST endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Response of `GET _session` and `POST _session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Whether the request succeeded.
    #[serde(default)]
    pub ok: bool,
    /// The authenticated user, if any.
    #[serde(rename = "userCtx", default)]
    pub user_ctx: UserContext,
}

impl SessionInfo {
    /// Returns the logged-in user name, treating an empty name as absent.
    pub fn user_name(&self) -> Option<&str> {
        self.user_ctx.name.as_deref().filter(|name| !name.is_empty())
    }
}

/// The `userCtx` member of a session response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    /// User name; `null` when not logged in.
    #[serde(default)]
    pub name: Option<String>,
    /// Roles granted to the user.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Response of a successful document `PUT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Whether the write succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Document ID.
    #[serde(default)]
    pub id: Option<String>,
    /// New revision marker.
    pub rev: String,
}

/// Body of `POST _revs_diff`: document ID to candidate revisions.
pub type RevsDiffRequest = BTreeMap<String, Vec<String>>;

/// One document entry of a `_revs_diff` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the remote does not have.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Revisions the remote has that may be ancestors of the missing ones.
    #[serde(default)]
    pub possible_ancestors: Vec<String>,
}

/// Response of `POST _revs_diff`.
pub type RevsDiffResponse = BTreeMap<String, RevsDiffEntry>;

/// Body of `POST _bulk_docs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Documents with their revision histories.
    pub docs: Vec<Map<String, Value>>,
    /// `false` to insert revisions verbatim instead of creating new ones.
    pub new_edits: bool,
}

/// One per-document result of a `_bulk_docs` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsItem {
    /// Document ID.
    #[serde(default)]
    pub id: Option<String>,
    /// Stored revision.
    #[serde(default)]
    pub rev: Option<String>,
    /// Error name, for failed items.
    #[serde(default)]
    pub error: Option<String>,
    /// Human-readable reason, for failed items.
    #[serde(default)]
    pub reason: Option<String>,
    /// Explicit HTTP-like status, for failed items.
    #[serde(default)]
    pub status: Option<u16>,
}

impl BulkDocsItem {
    /// Status code this item represents; `None` if the item succeeded.
    pub fn error_status(&self) -> Option<u16> {
        if let Some(status) = self.status.filter(|s| *s >= 300) {
            return Some(status);
        }
        let error = self.error.as_deref()?;
        Some(match error {
            "unauthorized" => 401,
            "forbidden" => 403,
            "conflict" => 409,
            "missing" | "not_found" => 404,
            _ => 502,
        })
    }
}
