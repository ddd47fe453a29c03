//! Scriptable in-memory remote database.
//!
//! [`MockRemote`] implements [`HttpClient`] by answering requests the way a
//! CouchDB-compatible server would, against documents held in memory. The
//! `_changes` feed serves the document history in all three feed modes;
//! tests can queue [`ScriptedFeed`] responses to inject resets and bad
//! statuses. Every request is recorded for later inspection.

use crate::fixtures::{multipart_document, Attachment};
use async_trait::async_trait;
use bytes::Bytes;
use docsync_engine::http::CookieJar;
use docsync_engine::{HttpClient, HttpRequest, HttpResponse, Method, SyncError, SyncResult};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

/// Default `Server` header.
pub const COUCHDB_SERVER: &str = "CouchDB/3.3.3 (Erlang OTP/25)";

/// Name of the cookie set by a successful login.
pub const SESSION_COOKIE: &str = "AuthSession";

/// A canned `_changes` response, served before the live feed.
#[derive(Debug, Clone)]
pub struct ScriptedFeed {
    status: u16,
    chunks: Vec<Bytes>,
    reset: bool,
    hang: bool,
}

impl ScriptedFeed {
    /// A 200 response whose body arrives in `chunks`.
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            status: 200,
            chunks: chunks.into_iter().map(Into::into).collect(),
            reset: false,
            hang: false,
        }
    }

    /// A response with `status` and a JSON error body.
    pub fn status(status: u16) -> Self {
        let body = json!({"error": "scripted", "reason": format!("scripted status {status}")});
        Self {
            status,
            chunks: vec![Bytes::from(body.to_string())],
            reset: false,
            hang: false,
        }
    }

    /// Ends the body with a connection reset after the chunks.
    pub fn then_reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// Keeps the body open after the chunks.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    fn into_response(self) -> HttpResponse {
        let mut items: Vec<SyncResult<Bytes>> = self.chunks.into_iter().map(Ok).collect();
        if self.reset {
            items.push(Err(SyncError::transport_retryable("connection reset by peer")));
        }
        let body = stream::iter(items);
        let body = if self.hang {
            body.chain(stream::pending()).boxed()
        } else {
            body.boxed()
        };
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_owned(), "application/json".to_owned());
        HttpResponse::new(self.status, headers, body)
    }
}

/// An injected error status for requests under one path segment.
#[derive(Debug, Clone)]
pub struct Failure {
    segment: String,
    status: u16,
    method: Option<Method>,
    skip: usize,
}

impl Failure {
    /// Answers requests whose first path segment is `segment` with `status`.
    pub fn new(segment: &str, status: u16) -> Self {
        Self {
            segment: segment.to_owned(),
            status,
            method: None,
            skip: 0,
        }
    }

    /// Only applies to requests with `method`.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Lets the first `count` matching requests through.
    pub fn after(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    fn applies(&mut self, method: Method, segment: &str) -> Option<u16> {
        if self.segment != segment || self.method.is_some_and(|m| m != method) {
            return None;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }
        Some(self.status)
    }
}

#[derive(Debug, Clone)]
struct StoredRevision {
    body: Map<String, Value>,
    history: Vec<String>,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
struct ChangeRow {
    seq: u64,
    doc_id: String,
    rev_id: String,
    deleted: bool,
}

impl ChangeRow {
    fn to_json(&self) -> Value {
        let mut row = json!({"seq": self.seq, "id": self.doc_id, "changes": [{"rev": self.rev_id}]});
        if self.deleted {
            row["deleted"] = Value::Bool(true);
        }
        row
    }
}

#[derive(Debug)]
struct RemoteState {
    exists: bool,
    docs: BTreeMap<String, BTreeMap<String, StoredRevision>>,
    changes: Vec<ChangeRow>,
    last_seq: u64,
    local: BTreeMap<String, Map<String, Value>>,
    scripted: VecDeque<ScriptedFeed>,
    failures: Vec<Failure>,
    rejected: BTreeSet<String>,
    offline: bool,
    server: String,
    credentials: Option<(String, String)>,
    user: Option<String>,
    root_session_only: bool,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            exists: true,
            docs: BTreeMap::new(),
            changes: Vec::new(),
            last_seq: 0,
            local: BTreeMap::new(),
            scripted: VecDeque::new(),
            failures: Vec::new(),
            rejected: BTreeSet::new(),
            offline: false,
            server: COUCHDB_SERVER.to_owned(),
            credentials: None,
            user: None,
            root_session_only: false,
        }
    }
}

impl RemoteState {
    fn insert(&mut self, doc_id: &str, rev_id: &str, body: Map<String, Value>, history: Vec<String>, attachments: Vec<Attachment>) {
        let deleted = body.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        self.docs.entry(doc_id.to_owned()).or_default().insert(
            rev_id.to_owned(),
            StoredRevision {
                body,
                history,
                attachments,
            },
        );
        self.last_seq += 1;
        self.changes.retain(|row| row.doc_id != doc_id);
        self.changes.push(ChangeRow {
            seq: self.last_seq,
            doc_id: doc_id.to_owned(),
            rev_id: rev_id.to_owned(),
            deleted,
        });
    }

    fn winning(&self, doc_id: &str) -> Option<&StoredRevision> {
        let row = self.changes.iter().find(|row| row.doc_id == doc_id)?;
        self.docs.get(doc_id)?.get(&row.rev_id)
    }

    fn rows_after(&self, since: u64, limit: Option<usize>) -> Vec<ChangeRow> {
        self.changes
            .iter()
            .filter(|row| row.seq > since)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    url: Url,
    state: Mutex<RemoteState>,
    sequence: watch::Sender<u64>,
    requests: Mutex<Vec<HttpRequest>>,
    cookies: CookieJar,
}

/// In-memory CouchDB-style database served through [`HttpClient`].
///
/// Clones share the same database.
#[derive(Debug, Clone)]
pub struct MockRemote {
    inner: Arc<Inner>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Creates an empty, existing database at `http://mock.local/db`.
    pub fn new() -> Self {
        Self::at("http://mock.local/db")
    }

    /// Creates an empty, existing database at `url`.
    ///
    /// # Panics
    ///
    /// Panics if `url` does not parse.
    pub fn at(url: &str) -> Self {
        let (sequence, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                url: Url::parse(url).expect("mock remote URL"),
                state: Mutex::new(RemoteState::default()),
                sequence,
                requests: Mutex::new(Vec::new()),
                cookies: CookieJar::new(),
            }),
        }
    }

    /// The database URL.
    pub fn url(&self) -> Url {
        self.inner.url.clone()
    }

    /// The database URL as a string.
    pub fn url_str(&self) -> String {
        self.inner.url.to_string()
    }

    /// The client to hand to sessions.
    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::new(self.clone())
    }

    /// Removes the database; requests other than `PUT` answer 404.
    pub fn without_database(self) -> Self {
        self.inner.state.lock().exists = false;
        self
    }

    /// Sets the `Server` header of every response.
    pub fn with_server(self, server: &str) -> Self {
        self.inner.state.lock().server = server.to_owned();
        self
    }

    /// Requires `POST _session` with these credentials.
    pub fn with_credentials(self, user: &str, password: &str) -> Self {
        self.inner.state.lock().credentials = Some((user.to_owned(), password.to_owned()));
        self
    }

    /// Answers `GET _session` only at the server root, as CouchDB does.
    pub fn with_root_session_only(self) -> Self {
        self.inner.state.lock().root_session_only = true;
        self
    }

    /// True if the database exists.
    pub fn database_exists(&self) -> bool {
        self.inner.state.lock().exists
    }

    /// Logged-in user, if any.
    pub fn logged_in_user(&self) -> Option<String> {
        self.inner.state.lock().user.clone()
    }

    /// Stores a new revision on top of the document's winning revision and
    /// returns its ID.
    pub fn put_document(&self, doc_id: &str, fields: Value) -> String {
        self.put_document_with_attachments(doc_id, fields, Vec::new())
    }

    /// Like [`MockRemote::put_document`], serving `attachments` with the
    /// revision.
    pub fn put_document_with_attachments(&self, doc_id: &str, fields: Value, attachments: Vec<Attachment>) -> String {
        let rev_id = {
            let mut state = self.inner.state.lock();
            let parent: Vec<String> = state.winning(doc_id).map(|rev| rev.history.clone()).unwrap_or_default();
            let generation = parent.len() + 1;
            let rev_id = format!("{generation}-r{}", state.last_seq + 1);
            let mut history = vec![rev_id.clone()];
            history.extend(parent);

            let mut body = match fields {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            body.insert("_id".into(), Value::String(doc_id.to_owned()));
            body.insert("_rev".into(), Value::String(rev_id.clone()));
            state.insert(doc_id, &rev_id, body, history, attachments);
            rev_id
        };
        self.notify();
        rev_id
    }

    /// Marks the document deleted and returns the tombstone revision ID.
    pub fn delete_document(&self, doc_id: &str) -> String {
        self.put_document(doc_id, json!({"_deleted": true}))
    }

    /// True if the remote stores this revision.
    pub fn has_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .docs
            .get(doc_id)
            .is_some_and(|revs| revs.contains_key(rev_id))
    }

    /// Winning revision body, without `_revisions`.
    pub fn document(&self, doc_id: &str) -> Option<Map<String, Value>> {
        self.inner.state.lock().winning(doc_id).map(|rev| rev.body.clone())
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.inner.state.lock().docs.len()
    }

    /// Latest sequence.
    pub fn last_sequence(&self) -> u64 {
        self.inner.state.lock().last_seq
    }

    /// The change line a continuous feed would send for the document's
    /// winning revision.
    ///
    /// # Panics
    ///
    /// Panics if the document does not exist.
    pub fn change_line(&self, doc_id: &str) -> String {
        let state = self.inner.state.lock();
        let row = state
            .changes
            .iter()
            .find(|row| row.doc_id == doc_id)
            .expect("document exists");
        format!("{}\n", row.to_json())
    }

    /// A `_local` document.
    pub fn checkpoint(&self, id: &str) -> Option<Map<String, Value>> {
        self.inner.state.lock().local.get(id).cloned()
    }

    /// Stores a `_local` document directly, bumping its revision.
    pub fn put_checkpoint(&self, id: &str, fields: Value) {
        let mut state = self.inner.state.lock();
        let rev = next_local_rev(state.local.get(id));
        let mut body = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("_id".into(), Value::String(format!("_local/{id}")));
        body.insert("_rev".into(), Value::String(rev));
        state.local.insert(id.to_owned(), body);
    }

    /// Queues a `_changes` response served before the live feed.
    pub fn script_feed(&self, feed: ScriptedFeed) {
        self.inner.state.lock().scripted.push_back(feed);
    }

    /// Answers every request whose first path segment is `segment` with
    /// `status`.
    pub fn fail(&self, segment: &str, status: u16) {
        self.inject(Failure::new(segment, status));
    }

    /// Adds a failure rule. Earlier rules win when several apply.
    pub fn inject(&self, failure: Failure) {
        self.inner.state.lock().failures.push(failure);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.inner.state.lock().failures.clear();
    }

    /// Rejects uploads of `doc_id` with 403.
    pub fn reject(&self, doc_id: &str) {
        self.inner.state.lock().rejected.insert(doc_id.to_owned());
    }

    /// Fails every request with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.state.lock().offline = offline;
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner.requests.lock().clone()
    }

    /// URLs of received requests whose path contains `fragment`.
    pub fn request_urls(&self, fragment: &str) -> Vec<String> {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|r| r.url.path().contains(fragment))
            .map(|r| r.url.to_string())
            .collect()
    }

    /// Number of received requests whose path contains `fragment`.
    pub fn request_count(&self, fragment: &str) -> usize {
        self.request_urls(fragment).len()
    }

    /// A cookie stored through [`HttpClient::set_cookie`] or a login.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.inner.cookies.get(&self.inner.url, name)
    }

    fn notify(&self) {
        let last = self.inner.state.lock().last_seq;
        self.inner.sequence.send_replace(last);
    }

    fn respond(&self, status: u16, body: Value) -> HttpResponse {
        let server = self.inner.state.lock().server.clone();
        HttpResponse::json(status, &body).with_header("Server", server)
    }

    fn path_segments(&self, url: &Url) -> Option<Vec<String>> {
        let base: Vec<&str> = self
            .inner
            .url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let path: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if path.len() < base.len() || path[..base.len()] != base[..] {
            return None;
        }
        Some(path[base.len()..].iter().map(|s| (*s).to_owned()).collect())
    }

    async fn route(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let Some(segments) = self.path_segments(&request.url) else {
            // Outside the database: only the server-root session endpoint.
            return Ok(if request.url.path() == "/_session" {
                self.session(&request)
            } else {
                self.respond(404, json!({"error": "not_found", "reason": "missing"}))
            });
        };
        let first = segments.first().map(String::as_str).unwrap_or("");

        let (exists, failure) = {
            let mut state = self.inner.state.lock();
            let failure = state
                .failures
                .iter_mut()
                .map(|rule| rule.applies(request.method, first))
                .fold(None, |found, status| found.or(status));
            (state.exists, failure)
        };
        if let Some(status) = failure {
            return Ok(self.respond(status, json!({"error": "injected", "reason": format!("injected {status}")})));
        }

        match (request.method, segments.as_slice()) {
            (Method::Put, []) => Ok(self.create_database()),
            _ if !exists => Ok(self.respond(404, json!({"error": "not_found", "reason": "no_db_file"}))),
            (method, [s]) if s == "_session" => {
                let root_only = self.inner.state.lock().root_session_only;
                if root_only && method == Method::Get {
                    Ok(self.respond(404, json!({"error": "not_found", "reason": "missing"})))
                } else {
                    Ok(self.session(&request))
                }
            }
            (Method::Get, [s]) if s == "_changes" => Ok(self.changes(&request).await),
            (Method::Post, [s]) if s == "_revs_diff" => self.revs_diff(&request),
            (Method::Post, [s]) if s == "_bulk_docs" => self.bulk_docs(&request),
            (Method::Get, [l, id]) if l == "_local" => Ok(match self.checkpoint(id) {
                Some(doc) => self.respond(200, Value::Object(doc)),
                None => self.respond(404, json!({"error": "not_found", "reason": "missing"})),
            }),
            (Method::Put, [l, id]) if l == "_local" => self.put_local(id, &request),
            (Method::Get, [doc_id]) => Ok(self.get_document(doc_id, &request)),
            (Method::Get, []) => Ok(self.respond(200, json!({"db_name": "db"}))),
            _ => Ok(self.respond(405, json!({"error": "method_not_allowed", "reason": "unsupported"}))),
        }
    }

    fn create_database(&self) -> HttpResponse {
        let mut state = self.inner.state.lock();
        if state.exists {
            drop(state);
            return self.respond(412, json!({"error": "file_exists", "reason": "The database could not be created, the file already exists."}));
        }
        state.exists = true;
        drop(state);
        self.respond(201, json!({"ok": true}))
    }

    fn session(&self, request: &HttpRequest) -> HttpResponse {
        match request.method {
            Method::Post => {
                let params = request.json_body().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
                let password = params.get("password").and_then(Value::as_str).unwrap_or_default();
                let accepted = {
                    let mut state = self.inner.state.lock();
                    let accepted = match &state.credentials {
                        Some((user, expected)) => *user == name && expected == password,
                        None => true,
                    };
                    if accepted {
                        state.user = Some(name.clone());
                    }
                    accepted
                };
                if accepted {
                    self.inner.cookies.set(&self.inner.url, SESSION_COOKIE, &format!("token-{name}"));
                    self.respond(200, json!({"ok": true, "name": name, "roles": []}))
                } else {
                    self.respond(401, json!({"error": "unauthorized", "reason": "Name or password is incorrect."}))
                }
            }
            _ => {
                let user = self.inner.state.lock().user.clone();
                self.respond(200, json!({"ok": true, "userCtx": {"name": user, "roles": []}}))
            }
        }
    }

    async fn changes(&self, request: &HttpRequest) -> HttpResponse {
        let scripted = self.inner.state.lock().scripted.pop_front();
        if let Some(feed) = scripted {
            let server = self.inner.state.lock().server.clone();
            return feed.into_response().with_header("Server", server);
        }

        let params: BTreeMap<String, String> = request.url.query_pairs().into_owned().collect();
        let since = params.get("since").and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let limit = params.get("limit").and_then(|s| s.parse::<usize>().ok());
        match params.get("feed").map(String::as_str) {
            Some("longpoll") => {
                let mut sequence = self.inner.sequence.subscribe();
                loop {
                    let rows = self.inner.state.lock().rows_after(since, limit);
                    if !rows.is_empty() {
                        return self.changes_body(&rows);
                    }
                    if sequence.changed().await.is_err() {
                        return self.changes_body(&[]);
                    }
                }
            }
            Some("continuous") => {
                let sequence = self.inner.sequence.subscribe();
                let inner = self.inner.clone();
                // An empty line is sent once each time the feed catches up.
                let feed = (inner, since, sequence, false);
                let body = stream::unfold(feed, |(inner, since, mut sequence, idle)| async move {
                    loop {
                        let rows = inner.state.lock().rows_after(since, None);
                        if let Some(last) = rows.last().map(|row| row.seq) {
                            let lines: String = rows.iter().map(|row| format!("{}\n", row.to_json())).collect();
                            return Some((Ok(Bytes::from(lines)), (inner, last, sequence, false)));
                        }
                        if !idle {
                            return Some((Ok(Bytes::from_static(b"\n")), (inner, since, sequence, true)));
                        }
                        if sequence.changed().await.is_err() {
                            return None;
                        }
                    }
                })
                .boxed();
                let server = self.inner.state.lock().server.clone();
                let mut headers = BTreeMap::new();
                headers.insert("content-type".to_owned(), "application/json".to_owned());
                HttpResponse::new(200, headers, body).with_header("Server", server)
            }
            _ => {
                let rows = self.inner.state.lock().rows_after(since, limit);
                self.changes_body(&rows)
            }
        }
    }

    fn changes_body(&self, rows: &[ChangeRow]) -> HttpResponse {
        let last_seq = rows.last().map_or_else(|| self.last_sequence(), |row| row.seq);
        let results: Vec<Value> = rows.iter().map(ChangeRow::to_json).collect();
        self.respond(200, json!({"results": results, "last_seq": last_seq}))
    }

    fn revs_diff(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let body: BTreeMap<String, Vec<String>> = serde_json::from_value(request.json_body()?)?;
        let state = self.inner.state.lock();
        let mut diff = Map::new();
        for (doc_id, revs) in body {
            let known = state.docs.get(&doc_id);
            let missing: Vec<String> = revs
                .into_iter()
                .filter(|rev| !known.is_some_and(|k| k.contains_key(rev)))
                .collect();
            if !missing.is_empty() {
                diff.insert(doc_id, json!({"missing": missing}));
            }
        }
        drop(state);
        Ok(self.respond(200, Value::Object(diff)))
    }

    fn bulk_docs(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let body = request.json_body()?;
        let docs = body.get("docs").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut items = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for doc in docs {
                let Value::Object(mut doc) = doc else {
                    continue;
                };
                let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_owned();
                let rev_id = doc.get("_rev").and_then(Value::as_str).unwrap_or_default().to_owned();
                if state.rejected.contains(&doc_id) {
                    items.push(json!({"id": doc_id, "rev": rev_id, "error": "forbidden", "reason": "rejected by validation"}));
                    continue;
                }
                let history = doc.remove("_revisions").map_or_else(|| vec![rev_id.clone()], |r| history_of(&r, &rev_id));
                state.insert(&doc_id, &rev_id, doc, history, Vec::new());
            }
        }
        self.notify();
        Ok(self.respond(201, Value::Array(items)))
    }

    fn put_local(&self, id: &str, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let Value::Object(mut body) = request.json_body()? else {
            return Ok(self.respond(400, json!({"error": "bad_request", "reason": "Document must be a JSON object"})));
        };
        let mut state = self.inner.state.lock();
        let stored = state.local.get(id);
        let stored_rev = stored.and_then(|doc| doc.get("_rev")).and_then(Value::as_str);
        let given_rev = body.get("_rev").and_then(Value::as_str);
        if stored_rev != given_rev {
            drop(state);
            return Ok(self.respond(409, json!({"error": "conflict", "reason": "Document update conflict."})));
        }
        let rev = next_local_rev(stored);
        body.insert("_id".into(), Value::String(format!("_local/{id}")));
        body.insert("_rev".into(), Value::String(rev.clone()));
        state.local.insert(id.to_owned(), body);
        drop(state);
        Ok(self.respond(201, json!({"ok": true, "id": format!("_local/{id}"), "rev": rev})))
    }

    fn get_document(&self, doc_id: &str, request: &HttpRequest) -> HttpResponse {
        let rev = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "rev")
            .map(|(_, value)| value.into_owned());
        let found = {
            let state = self.inner.state.lock();
            match &rev {
                Some(rev) => state.docs.get(doc_id).and_then(|revs| revs.get(rev)).cloned(),
                None => state.winning(doc_id).cloned(),
            }
        };
        let Some(found) = found else {
            return self.respond(404, json!({"error": "not_found", "reason": "missing"}));
        };

        let mut body = found.body.clone();
        let history: Vec<&str> = found.history.iter().map(String::as_str).collect();
        body.insert("_revisions".into(), crate::fixtures::revisions_json(&history));
        if found.attachments.is_empty() {
            return self.respond(200, Value::Object(body));
        }
        let (content_type, encoded) = multipart_document(&body, &found.attachments);
        let server = self.inner.state.lock().server.clone();
        HttpResponse::from_bytes(200, &content_type, encoded).with_header("Server", server)
    }
}

fn next_local_rev(stored: Option<&Map<String, Value>>) -> String {
    let generation = stored
        .and_then(|doc| doc.get("_rev"))
        .and_then(Value::as_str)
        .and_then(|rev| rev.strip_prefix("0-"))
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("0-{}", generation + 1)
}

fn history_of(revisions: &Value, rev_id: &str) -> Vec<String> {
    let start = revisions.get("start").and_then(Value::as_u64);
    let ids = revisions.get("ids").and_then(Value::as_array);
    match (start, ids) {
        (Some(start), Some(ids)) => ids
            .iter()
            .filter_map(Value::as_str)
            .enumerate()
            .map(|(i, suffix)| format!("{}-{suffix}", start.saturating_sub(i as u64)))
            .collect(),
        _ => vec![rev_id.to_owned()],
    }
}

#[async_trait]
impl HttpClient for MockRemote {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        self.inner.requests.lock().push(request.clone());
        if self.inner.state.lock().offline {
            return Err(SyncError::transport_retryable("mock remote is offline"));
        }
        self.route(request).await
    }

    fn set_cookie(&self, url: &Url, name: &str, value: &str) {
        self.inner.cookies.set(url, name, value);
    }

    fn delete_cookie(&self, url: &Url, name: &str) {
        self.inner.cookies.delete(url, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: HttpResponse) -> Value {
        serde_json::from_slice(&response.bytes().await.unwrap()).unwrap()
    }

    fn get(remote: &MockRemote, path: &str) -> HttpRequest {
        HttpRequest::get(remote.url().join(path).unwrap())
    }

    #[tokio::test]
    async fn normal_feed_lists_latest_revision_per_document() {
        let remote = MockRemote::at("http://mock.local/db/");
        remote.put_document("a", json!({}));
        remote.put_document("b", json!({}));
        let second = remote.put_document("a", json!({"v": 2}));

        let response = remote.send(get(&remote, "_changes?feed=normal&since=0")).await.unwrap();
        let body = body_of(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["id"], "a");
        assert_eq!(results[1]["changes"][0]["rev"], second.as_str());
        assert_eq!(body["last_seq"], 3);
        assert!(second.starts_with("2-"));
    }

    #[tokio::test]
    async fn local_documents_detect_conflicts() {
        let remote = MockRemote::at("http://mock.local/db/");
        let url = remote.url().join("_local/cp").unwrap();

        let put = HttpRequest::json(Method::Put, url.clone(), &json!({"lastSequence": "1"}));
        let first = body_of(remote.send(put).await.unwrap()).await;
        assert_eq!(first["rev"], "0-1");

        let stale = HttpRequest::json(Method::Put, url.clone(), &json!({"lastSequence": "2"}));
        assert_eq!(remote.send(stale).await.unwrap().status, 409);

        let fresh = HttpRequest::json(Method::Put, url, &json!({"_rev": "0-1", "lastSequence": "2"}));
        assert_eq!(remote.send(fresh).await.unwrap().status, 201);
        assert_eq!(remote.checkpoint("cp").unwrap()["lastSequence"], "2");
    }

    #[tokio::test]
    async fn scripted_feed_is_served_first() {
        let remote = MockRemote::at("http://mock.local/db/");
        remote.script_feed(ScriptedFeed::status(503));
        let response = remote.send(get(&remote, "_changes")).await.unwrap();
        assert_eq!(response.status, 503);
        let response = remote.send(get(&remote, "_changes")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(remote.request_count("_changes"), 2);
    }

    #[tokio::test]
    async fn continuous_feed_sends_a_heartbeat_when_caught_up() {
        let remote = MockRemote::at("http://mock.local/db/");
        remote.put_document("a", json!({}));
        let response = remote.send(get(&remote, "_changes?feed=continuous")).await.unwrap();
        let mut body = response.into_body();

        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("\"seq\":1"));
        assert_eq!(&body.next().await.unwrap().unwrap()[..], b"\n");

        remote.put_document("b", json!({}));
        let next = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&next).contains("\"id\":\"b\""));
        assert_eq!(&body.next().await.unwrap().unwrap()[..], b"\n");
    }

    #[tokio::test]
    async fn failure_rules_match_method_and_count() {
        let remote = MockRemote::at("http://mock.local/db/");
        remote.inject(Failure::new("_local", 500).method(Method::Get).after(1));
        let url = remote.url().join("_local/cp").unwrap();

        assert_eq!(remote.send(HttpRequest::get(url.clone())).await.unwrap().status, 404);
        assert_eq!(remote.send(HttpRequest::get(url.clone())).await.unwrap().status, 500);
        let put = HttpRequest::json(Method::Put, url.clone(), &json!({"lastSequence": "1"}));
        assert_eq!(remote.send(put).await.unwrap().status, 201);

        remote.clear_failures();
        assert_eq!(remote.send(HttpRequest::get(url)).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn bulk_docs_stores_history_and_rejects() {
        let remote = MockRemote::at("http://mock.local/db/");
        remote.reject("nope");
        let body = json!({
            "new_edits": false,
            "docs": [
                {"_id": "a", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}},
                {"_id": "nope", "_rev": "1-x"},
            ],
        });
        let request = HttpRequest::json(Method::Post, remote.url().join("_bulk_docs").unwrap(), &body);
        let items = body_of(remote.send(request).await.unwrap()).await;
        assert_eq!(items.as_array().unwrap().len(), 1);
        assert_eq!(items[0]["error"], "forbidden");
        assert!(remote.has_revision("a", "2-b"));
        assert!(!remote.has_revision("nope", "1-x"));
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let remote = MockRemote::new().with_credentials("alice", "secret");
        let url = Url::parse("http://mock.local/db/_session").unwrap();
        let wrong = HttpRequest::json(Method::Post, url.clone(), &json!({"name": "alice", "password": "x"}));
        assert_eq!(remote.send(wrong).await.unwrap().status, 401);

        let right = HttpRequest::json(Method::Post, url, &json!({"name": "alice", "password": "secret"}));
        assert_eq!(remote.send(right).await.unwrap().status, 200);
        assert_eq!(remote.logged_in_user().as_deref(), Some("alice"));
        assert_eq!(remote.cookie(SESSION_COOKIE).as_deref(), Some("token-alice"));
    }
}
