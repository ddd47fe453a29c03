//! Integration tests: whole sessions against the in-memory remote.

use async_trait::async_trait;
use docsync_engine::{
    BackoffPolicy, BatcherConfig, ChangeEvent, ChangeTracker, ChangeTrackerClient, Direction, FeedMode, HttpClient,
    HttpRequest, HttpResponse, LocalStore, MemoryStore, Method, ReplicationConfig, ReplicationSession,
    ReplicationState, ReplicationTrigger, SessionAuthenticator, SessionBuilder, SyncError, TrackerOptions,
};
use docsync_protocol::ChangeEntry;
use docsync_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

fn config(remote: &MockRemote, direction: Direction) -> ReplicationConfig {
    ReplicationConfig::new(&remote.url_str(), direction)
        .unwrap()
        .with_batcher(BatcherConfig::new(100, Duration::from_millis(10)))
        .with_backoff(BackoffPolicy::testing())
}

fn session(remote: &MockRemote, store: &Arc<MemoryStore>, config: ReplicationConfig) -> ReplicationSession {
    ReplicationSession::new(config, store.clone(), remote.client()).unwrap()
}

fn remote_sequence(remote: &MockRemote, session: &ReplicationSession) -> Option<String> {
    remote
        .checkpoint(session.checkpoint_id())
        .and_then(|doc| doc.get("lastSequence").and_then(|v| v.as_str()).map(str::to_owned))
}

#[tokio::test]
async fn continuous_pull_survives_a_connection_reset() {
    init_tracing();
    let remote = MockRemote::new();
    let rev = remote.put_document("doc1", json!({"title": "first"}));
    remote.script_feed(ScriptedFeed::chunks([remote.change_line("doc1")]).then_reset());

    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull).with_continuous(true));
    session.start();

    wait_for_state(&session, ReplicationState::Idle).await;
    wait_until("the feed to reconnect", || remote.request_count("_changes") >= 2).await;

    let urls = remote.request_urls("_changes");
    assert!(urls[0].contains("feed=continuous"));
    assert!(!urls[0].contains("since="));
    assert!(urls[1].contains("since=1"), "{}", urls[1]);
    assert_eq!(session.changes_count(), 1);
    assert_eq!(session.completed_changes_count(), 1);
    assert!(store.contains_revision("doc1", &rev).unwrap());
    assert!(session.error().is_none());

    session.stop();
    wait_for_stop(&session).await;
    assert_eq!(session.last_sequence().as_deref(), Some("1"));
    assert_eq!(remote_sequence(&remote, &session).as_deref(), Some("1"));
}

#[tokio::test]
async fn one_shot_pull_stores_documents_and_attachments() {
    init_tracing();
    let remote = MockRemote::new();
    let a = remote.put_document("a", json!({"n": 1}));
    let photo = Attachment::new("photo.jpg", "image/jpeg", vec![7u8; 42]);
    let b = remote.put_document_with_attachments("b", json!({"n": 2}), vec![photo.clone()]);

    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    session.start();
    wait_for_stop(&session).await;

    assert!(session.error().is_none(), "{:?}", session.error());
    assert!(store.contains_revision("a", &a).unwrap());
    assert!(store.contains_revision("b", &b).unwrap());
    assert_eq!(session.completed_changes_count(), 2);

    let stored = store.document("b").unwrap();
    assert_eq!(stored["_attachments"]["photo.jpg"]["digest"], photo.digest());
    assert!(store.pending_attachment_digests().contains(&photo.digest()));

    assert_eq!(remote_sequence(&remote, &session).as_deref(), Some("2"));
    assert_eq!(
        store.read_last_sequence(session.checkpoint_id(), Direction::Pull).unwrap().as_deref(),
        Some("2")
    );
    assert!(remote.request_urls("_changes")[0].contains("feed=normal"));
}

#[tokio::test]
async fn second_pull_resumes_from_the_checkpoint() {
    let remote = MockRemote::new();
    remote.put_document("a", json!({}));
    let store = Arc::new(MemoryStore::new());

    let first = session(&remote, &store, config(&remote, Direction::Pull));
    first.start();
    wait_for_stop(&first).await;
    assert_eq!(first.completed_changes_count(), 1);

    let b = remote.put_document("b", json!({}));
    let second = session(&remote, &store, config(&remote, Direction::Pull));
    assert_eq!(second.checkpoint_id(), first.checkpoint_id());
    second.start();
    wait_for_stop(&second).await;

    let urls = remote.request_urls("_changes");
    assert!(urls.last().unwrap().contains("since=1"));
    assert_eq!(second.completed_changes_count(), 1);
    assert!(store.contains_revision("b", &b).unwrap());
    assert_eq!(remote_sequence(&remote, &second).as_deref(), Some("2"));
}

#[tokio::test]
async fn failed_fetch_counts_and_holds_the_checkpoint() {
    let remote = MockRemote::new();
    remote.put_document("a", json!({}));
    remote.put_document("b", json!({}));
    remote.fail("a", 500);

    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    session.start();
    wait_for_stop(&session).await;

    assert_eq!(session.revisions_failed(), 1);
    assert_eq!(session.completed_changes_count(), 2);
    assert_eq!(session.error().and_then(|e| e.status()), Some(500));
    assert_eq!(store.revision_count(), 1);
    assert_eq!(remote_sequence(&remote, &session), None);
}

#[tokio::test]
async fn doc_ids_limit_what_is_pulled() {
    let remote = MockRemote::new();
    remote.put_document("a", json!({}));
    remote.put_document("b", json!({}));

    let store = Arc::new(MemoryStore::new());
    let session = session(
        &remote,
        &store,
        config(&remote, Direction::Pull).with_doc_ids(vec!["b".into()]),
    );
    session.start();
    wait_for_stop(&session).await;

    assert_eq!(session.changes_count(), 1);
    assert!(store.document("a").is_none());
    assert!(store.document("b").is_some());
    assert_eq!(remote_sequence(&remote, &session).as_deref(), Some("2"));
}

#[tokio::test]
async fn one_shot_push_uploads_missing_revisions() {
    init_tracing();
    let remote = MockRemote::new();
    let store = Arc::new(MemoryStore::new());
    let a = store.create_revision("a", Map::new()).unwrap();
    let b = store.create_revision("b", Map::new()).unwrap();

    let session = session(&remote, &store, config(&remote, Direction::Push));
    session.start();
    wait_for_stop(&session).await;

    assert!(session.error().is_none(), "{:?}", session.error());
    assert!(remote.has_revision("a", &a));
    assert!(remote.has_revision("b", &b));
    assert_eq!(session.completed_changes_count(), 2);
    assert_eq!(remote.request_count("_revs_diff"), 1);
    assert_eq!(remote.request_count("_bulk_docs"), 1);
    assert_eq!(remote_sequence(&remote, &session).as_deref(), Some("2"));
}

#[tokio::test]
async fn rejected_upload_is_a_failed_revision() {
    let remote = MockRemote::new();
    remote.reject("b");
    let store = Arc::new(MemoryStore::new());
    let a = store.create_revision("a", Map::new()).unwrap();
    store.create_revision("b", Map::new()).unwrap();

    let session = session(&remote, &store, config(&remote, Direction::Push));
    session.start();
    wait_for_stop(&session).await;

    assert!(remote.has_revision("a", &a));
    assert_eq!(session.revisions_failed(), 1);
    assert_eq!(session.error().and_then(|e| e.status()), Some(403));
    assert_eq!(remote_sequence(&remote, &session), None);
}

#[tokio::test]
async fn push_creates_a_missing_target() {
    let remote = MockRemote::new().without_database();
    let store = Arc::new(MemoryStore::new());
    let a = store.create_revision("a", Map::new()).unwrap();

    let session = session(&remote, &store, config(&remote, Direction::Push).with_create_target(true));
    session.start();
    wait_for_stop(&session).await;

    assert!(session.error().is_none(), "{:?}", session.error());
    assert!(remote.database_exists());
    assert!(remote.has_revision("a", &a));
}

#[tokio::test]
async fn continuous_push_follows_local_changes() {
    let remote = MockRemote::new();
    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Push).with_continuous(true));
    session.start();
    wait_for_state(&session, ReplicationState::Idle).await;

    let a = store.create_revision("a", Map::new()).unwrap();
    wait_until("the revision to be pushed", || remote.has_revision("a", &a)).await;
    wait_until("the completed count", || session.completed_changes_count() == 1).await;

    session.stop();
    wait_for_stop(&session).await;
    assert_eq!(remote_sequence(&remote, &session).as_deref(), Some("1"));
}

#[tokio::test]
async fn session_login_falls_back_to_server_root() {
    let remote = MockRemote::new().with_credentials("alice", "secret").with_root_session_only();
    remote.put_document("a", json!({}));
    let store = Arc::new(MemoryStore::new());

    let session = SessionBuilder::new(config(&remote, Direction::Pull), store.clone(), remote.client())
        .authenticator(Arc::new(SessionAuthenticator::new("alice", "secret")))
        .build()
        .unwrap();
    session.start();
    wait_for_stop(&session).await;

    assert!(session.error().is_none(), "{:?}", session.error());
    assert_eq!(remote.logged_in_user().as_deref(), Some("alice"));
    assert_eq!(remote.cookie(SESSION_COOKIE).as_deref(), Some("token-alice"));
    let sessions = remote.request_urls("_session");
    assert_eq!(sessions[0], "http://mock.local/db/_session");
    assert_eq!(sessions[1], "http://mock.local/_session");
    assert_eq!(store.revision_count(), 1);
}

#[tokio::test]
async fn bad_credentials_stop_the_session() {
    let remote = MockRemote::new().with_credentials("alice", "secret");
    let store = Arc::new(MemoryStore::new());
    let session = SessionBuilder::new(config(&remote, Direction::Pull), store, remote.client())
        .authenticator(Arc::new(SessionAuthenticator::new("alice", "wrong")))
        .build()
        .unwrap();
    session.start();
    wait_for_stop(&session).await;

    assert!(matches!(session.error(), Some(SyncError::AuthenticationFailed(_))));
    assert_eq!(remote.request_count("_changes"), 0);
}

#[tokio::test]
async fn reachability_moves_the_session_offline_and_back() {
    let remote = MockRemote::new();
    remote.put_document("a", json!({}));
    let store = Arc::new(MemoryStore::new());
    let (online, reachability) = watch::channel(true);

    let session = SessionBuilder::new(
        config(&remote, Direction::Pull).with_continuous(true),
        store.clone(),
        remote.client(),
    )
    .reachability(reachability)
    .build()
    .unwrap();
    session.start();
    wait_for_state(&session, ReplicationState::Idle).await;

    online.send_replace(false);
    wait_for_state(&session, ReplicationState::Offline).await;
    let b = remote.put_document("b", json!({}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!store.contains_revision("b", &b).unwrap());

    online.send_replace(true);
    wait_until("b to arrive", || store.contains_revision("b", &b).unwrap_or(false)).await;
    wait_for_state(&session, ReplicationState::Idle).await;
    assert!(remote.request_urls("_changes").last().unwrap().contains("since=1"));

    session.stop_immediately();
    wait_for_stop(&session).await;
}

#[tokio::test]
async fn illegal_triggers_are_silent() {
    let remote = MockRemote::new();
    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    let events = Arc::new(Mutex::new(Vec::<ChangeEvent>::new()));
    let sink = events.clone();
    session.add_listener(Arc::new(move |event: &ChangeEvent| sink.lock().push(event.clone())));

    for trigger in ReplicationTrigger::ALL {
        if trigger != ReplicationTrigger::Start {
            session.fire(trigger);
        }
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(session.state(), ReplicationState::Initial);
    assert!(events.lock().is_empty());
    assert!(remote.requests().is_empty());
}

#[tokio::test]
async fn sync_gateway_is_detected_from_the_server_header() {
    let remote = MockRemote::new().with_server("Couchbase Sync Gateway/2.8.3");
    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    session.start();
    wait_for_stop(&session).await;

    assert!(session.server_is_sync_gateway_version("2.5"));
    assert!(!session.server_is_sync_gateway_version("2.10"));
}

#[tokio::test]
async fn server_header_is_recorded_from_error_responses() {
    let remote = MockRemote::new().with_server("Couchbase Sync Gateway/2.8.3");
    remote.fail("_local", 500);
    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    session.start();
    wait_for_stop(&session).await;

    assert_eq!(session.error().and_then(|e| e.status()), Some(500));
    assert!(session.server_is_sync_gateway_version("2.8"));
}

#[tokio::test]
async fn failed_checkpoint_refresh_waits_for_the_next_save() {
    init_tracing();
    let remote = MockRemote::new();
    let rev = remote.put_document("a", json!({}));
    remote.inject(Failure::new("_local", 409).method(Method::Put));
    remote.inject(Failure::new("_local", 500).method(Method::Get).after(1));

    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull));
    session.start();
    wait_for_stop(&session).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.contains_revision("a", &rev).unwrap());
    let local = |method: Method| {
        remote
            .requests()
            .iter()
            .filter(|r| r.method == method && r.url.path().contains("/_local/"))
            .count()
    };
    let puts = local(Method::Put);
    let gets = local(Method::Get);
    assert!((1..=3).contains(&puts), "{puts} checkpoint saves");
    // The initial fetch plus one refresh per conflict.
    assert_eq!(gets, puts + 1);
    assert_eq!(remote_sequence(&remote, &session), None);
}

#[tokio::test]
async fn continuous_pull_of_an_empty_remote_goes_idle() {
    let remote = MockRemote::new();
    let store = Arc::new(MemoryStore::new());
    let session = session(&remote, &store, config(&remote, Direction::Pull).with_continuous(true));
    session.start();
    wait_for_state(&session, ReplicationState::Idle).await;
    assert_eq!(session.changes_count(), 0);

    let b = remote.put_document("b", json!({}));
    wait_until("b to arrive", || store.contains_revision("b", &b).unwrap_or(false)).await;

    session.stop();
    wait_for_stop(&session).await;
    assert!(session.error().is_none(), "{:?}", session.error());
}

#[tokio::test]
async fn continuous_pull_with_only_filtered_changes_goes_idle() {
    let remote = MockRemote::new();
    remote.put_document("a", json!({}));
    let store = Arc::new(MemoryStore::new());
    let session = session(
        &remote,
        &store,
        config(&remote, Direction::Pull)
            .with_continuous(true)
            .with_doc_ids(vec!["other".into()]),
    );
    session.start();
    wait_for_state(&session, ReplicationState::Idle).await;

    assert_eq!(session.changes_count(), 0);
    assert!(store.document("a").is_none());
    assert_eq!(session.last_sequence().as_deref(), Some("1"));

    session.stop();
    wait_for_stop(&session).await;
}

#[tokio::test]
async fn session_cookies_go_to_the_authenticator_client() {
    let remote = MockRemote::new().with_credentials("alice", "secret");
    let decoy = MockRemote::new();
    let store = Arc::new(MemoryStore::new());

    let session = SessionBuilder::new(config(&remote, Direction::Pull), store, decoy.client())
        .authenticator(Arc::new(
            SessionAuthenticator::new("alice", "secret").with_http_client(remote.client()),
        ))
        .build()
        .unwrap();
    session.set_cookie("Extra", "v");
    assert_eq!(remote.cookie("Extra").as_deref(), Some("v"));
    assert_eq!(decoy.cookie("Extra"), None);

    session.start();
    wait_for_stop(&session).await;
    assert!(session.error().is_none(), "{:?}", session.error());
    assert!(decoy.requests().is_empty());

    session.delete_cookie("Extra");
    assert_eq!(remote.cookie("Extra"), None);
}

/// Passes requests through, closing the store once a document is fetched.
struct CloseOnFetch {
    inner: Arc<dyn HttpClient>,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl HttpClient for CloseOnFetch {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SyncError> {
        let fetch = request.method == Method::Get && request.url.query_pairs().any(|(key, _)| key == "rev");
        let response = self.inner.send(request).await;
        if fetch {
            self.store.close();
        }
        response
    }

    fn set_cookie(&self, url: &Url, name: &str, value: &str) {
        self.inner.set_cookie(url, name, value);
    }

    fn delete_cookie(&self, url: &Url, name: &str) {
        self.inner.delete_cookie(url, name);
    }
}

#[tokio::test]
async fn store_closed_during_a_fetch_fails_the_revision() {
    let remote = MockRemote::new();
    let photo = Attachment::new("photo.jpg", "image/jpeg", vec![1u8; 16]);
    remote.put_document_with_attachments("a", json!({}), vec![photo]);
    let store = Arc::new(MemoryStore::new());
    let http = Arc::new(CloseOnFetch {
        inner: remote.client(),
        store: store.clone(),
    });

    let session = ReplicationSession::new(config(&remote, Direction::Pull), store.clone(), http).unwrap();
    session.start();
    wait_for_stop(&session).await;

    assert!(matches!(session.error(), Some(SyncError::StoreClosed)));
    assert_eq!(session.revisions_failed(), 1);
    assert_eq!(store.revision_count(), 0);
    assert!(store.pending_attachment_digests().is_empty());
}

#[derive(Default)]
struct Collected {
    changes: Mutex<Vec<ChangeEntry>>,
}

impl ChangeTrackerClient for Collected {
    fn received_changes(&self, changes: Vec<ChangeEntry>) {
        self.changes.lock().extend(changes);
    }

    fn tracker_stopped(&self, _error: Option<SyncError>) {}
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn continuous_feed_survives_arbitrary_chunking((rows, chunks) in chunked_feed_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let received = runtime.block_on(async {
            let remote = MockRemote::new();
            remote.script_feed(ScriptedFeed::chunks(chunks).then_hang());
            let collected = Arc::new(Collected::default());
            let tracker = ChangeTracker::new(
                remote.client(),
                &remote.url(),
                FeedMode::Continuous,
                TrackerOptions::default(),
                collected.clone(),
            )
            .unwrap();
            tracker.start();
            wait_until("every row", || collected.changes.lock().len() == rows.len()).await;
            tracker.stop();
            let received = collected.changes.lock().clone();
            received
        });

        let seqs: Vec<String> = received.iter().map(|c| c.seq.clone()).collect();
        let expected: Vec<String> = rows
            .iter()
            .map(|row| match &row["seq"] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        prop_assert_eq!(seqs, expected);
    }
}
