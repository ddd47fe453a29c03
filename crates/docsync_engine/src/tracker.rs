//! Change tracker: the client of the remote `_changes` feed.
//!
//! A tracker owns one tokio task and at most one outstanding request. The
//! loop retries transport failures with exponential backoff and stops for
//! good on an error status or an unusable response. Stopping cancels the
//! in-flight request by dropping its future.

use crate::auth::Authenticator;
use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::FeedConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::{db_url, embedded_credentials, masked, strip_credentials, HttpClient, HttpRequest};
use docsync_protocol::{ChangeEntry, FeedMode, JsonObjectSplitter, SplitMode};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use url::Url;

/// Receiver of change-feed events.
///
/// Callbacks run on the tracker task and must not block; implementations
/// typically forward to their own queue.
pub trait ChangeTrackerClient: Send + Sync {
    /// Changes parsed from the feed, in feed order.
    fn received_changes(&self, changes: Vec<ChangeEntry>);

    /// The tracker stopped. Called exactly once per tracker.
    fn tracker_stopped(&self, error: Option<SyncError>);

    /// A feed response arrived, before its status is checked.
    fn response_received(&self, _server: Option<&str>) {}

    /// The feed has delivered every change the remote had: a long-poll
    /// page came back short, or a continuous feed sent a heartbeat.
    fn caught_up(&self) {}
}

/// Optional settings of a [`ChangeTracker`].
#[derive(Clone, Default)]
pub struct TrackerOptions {
    /// Sequence to resume from.
    pub since: Option<String>,
    /// Filter function name.
    pub filter: Option<String>,
    /// Filter parameters, flattened into the query in key order.
    pub filter_params: Option<BTreeMap<String, Value>>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Request decorator.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Feed parameters.
    pub feed: FeedConfig,
    /// Retry policy for transport failures.
    pub backoff: BackoffPolicy,
}

impl TrackerOptions {
    /// Sets the sequence to resume from.
    pub fn with_since(mut self, since: Option<String>) -> Self {
        self.since = since;
        self
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: Option<String>, params: Option<BTreeMap<String, Value>>) -> Self {
        self.filter = filter;
        self.filter_params = params;
        self
    }

    /// Sets extra request headers.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the authenticator.
    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Sets the feed parameters.
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Long-running reader of the remote change feed.
pub struct ChangeTracker {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    http: Arc<dyn HttpClient>,
    changes_url: Url,
    display_url: String,
    credentials: Option<(String, String)>,
    mode: FeedMode,
    options: TrackerOptions,
    last_sequence: Mutex<Option<String>>,
    client: Mutex<Option<Arc<dyn ChangeTrackerClient>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    failures: AtomicU32,
    error: Mutex<Option<SyncError>>,
}

enum Outcome {
    /// Start the next request right away.
    Continue,
    /// The feed is complete.
    Done,
    /// Transport failure; back off and retry.
    Retry(SyncError),
    /// Unrecoverable for this feed.
    Fatal(SyncError),
}

impl ChangeTracker {
    /// Creates a tracker for the database at `database_url`.
    ///
    /// Credentials embedded in the URL as `user:password` are sent
    /// preemptively as basic auth; other user info is ignored.
    pub fn new(
        http: Arc<dyn HttpClient>,
        database_url: &Url,
        mode: FeedMode,
        options: TrackerOptions,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> SyncResult<Self> {
        let credentials = embedded_credentials(database_url);

        let changes_url = db_url(&strip_credentials(database_url), &["_changes"])?;
        let display_url = masked(database_url);

        Ok(Self {
            shared: Arc::new(Shared {
                http,
                changes_url,
                display_url,
                credentials,
                mode,
                last_sequence: Mutex::new(options.since.clone()),
                options,
                client: Mutex::new(Some(client)),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                failures: AtomicU32::new(0),
                error: Mutex::new(None),
            }),
            task: Mutex::new(None),
        })
    }

    /// Spawns the run loop. Calling `start` twice, or after `stop`, has no
    /// effect.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            shared.run().await;
            shared.notify_stopped();
        }));
    }

    /// Cancels the outstanding request and terminates the loop.
    ///
    /// Idempotent; the client is notified the first time the tracker stops,
    /// whether by this call or on its own.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            debug!(url = %self.shared.display_url, "change tracker asked to stop");
        }
        self.shared.cancel.cancel();
        self.shared.notify_stopped();
    }

    /// Returns true while the run loop is active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Last sequence received from the feed.
    pub fn last_sequence(&self) -> Option<String> {
        self.shared.last_sequence.lock().clone()
    }

    /// Number of consecutive transport failures.
    pub fn failures(&self) -> u32 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Error that terminated the feed, if any.
    pub fn error(&self) -> Option<SyncError> {
        self.shared.error.lock().clone()
    }

    /// Delivery mode.
    pub fn mode(&self) -> FeedMode {
        self.shared.mode
    }

    /// URL of the next feed request.
    pub fn changes_feed_url(&self) -> Url {
        self.shared.feed_url()
    }

    /// Waits for the run loop task to exit.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    fn feed_url(&self) -> Url {
        let mut url = self.changes_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("feed", self.mode.as_param());
            if self.mode == FeedMode::LongPoll {
                query.append_pair("limit", &self.options.feed.longpoll_limit.to_string());
            }
            query.append_pair(
                "heartbeat",
                &self.options.feed.heartbeat.as_millis().to_string(),
            );
            if let Some(since) = self.last_sequence.lock().as_deref() {
                query.append_pair("since", since);
            }
            if let Some(filter) = &self.options.filter {
                query.append_pair("filter", filter);
                for (key, value) in self.options.filter_params.iter().flatten() {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    query.append_pair(key, &value);
                }
            }
        }
        url
    }

    fn request(&self) -> HttpRequest {
        let mut request = HttpRequest::get(self.feed_url());
        for (name, value) in &self.options.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        if let Some((user, password)) = &self.credentials {
            request = request.with_basic_auth(user.clone(), password.clone());
        }
        match &self.options.authenticator {
            Some(auth) => auth.decorate(request),
            None => request,
        }
    }

    async fn run(&self) {
        let mut backoff = Backoff::new(self.options.backoff);

        while self.is_running() {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.exchange(&mut backoff) => outcome,
            };
            self.failures.store(backoff.failures(), Ordering::SeqCst);

            match outcome {
                Outcome::Continue => {}
                Outcome::Done => break,
                Outcome::Fatal(err) => {
                    *self.error.lock() = Some(err);
                    break;
                }
                Outcome::Retry(err) => {
                    if !self.is_running() {
                        // Failure caused by our own shutdown.
                        break;
                    }
                    let delay = backoff.record_failure();
                    self.failures.store(backoff.failures(), Ordering::SeqCst);
                    warn!(
                        url = %self.display_url,
                        error = %err,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "change feed request failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(url = %self.display_url, "change tracker run loop exiting");
    }

    async fn exchange(&self, backoff: &mut Backoff) -> Outcome {
        let request = self.request();
        trace!(url = %request.url, "requesting change feed");

        let response = match self.http.send(request).await {
            Ok(response) => response,
            Err(err) => return Outcome::Retry(err),
        };
        self.with_client(|client| client.response_received(response.header("server")));

        if response.status >= 300 {
            let status = response.status;
            let err = match response.error_for_status().await {
                Err(err) => err,
                Ok(_) => SyncError::http(status, "unexpected status"),
            };
            error!(url = %self.display_url, status, error = %err, "change tracker got error status");
            return Outcome::Fatal(err);
        }

        match self.mode {
            FeedMode::LongPoll => {
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(err) => return Outcome::Retry(err),
                };
                let mut splitter = JsonObjectSplitter::new(SplitMode::ArrayElements);
                let parsed = splitter
                    .push(&body)
                    .and_then(|objects| splitter.finish().map(|()| objects));
                match parsed {
                    Ok(objects) => {
                        let short = objects.len() < self.options.feed.longpoll_limit as usize;
                        let delivered = self.deliver(objects);
                        if short {
                            self.with_client(|client| client.caught_up());
                        }
                        trace!(delivered, "starting new longpoll");
                        backoff.reset();
                        Outcome::Continue
                    }
                    Err(err) => {
                        warn!(url = %self.display_url, error = %err, "unusable longpoll response");
                        Outcome::Fatal(err.into())
                    }
                }
            }
            FeedMode::OneShot | FeedMode::Continuous => {
                let split_mode = if self.mode == FeedMode::OneShot {
                    SplitMode::ArrayElements
                } else {
                    SplitMode::Concatenated
                };
                let mut splitter = JsonObjectSplitter::new(split_mode);
                let mut body = response.into_body();

                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => return Outcome::Retry(err),
                    };
                    let heartbeats = splitter.heartbeats();
                    match splitter.push(&chunk) {
                        Ok(objects) => {
                            if self.deliver(objects) > 0 {
                                backoff.reset();
                            }
                            if self.mode == FeedMode::Continuous && splitter.heartbeats() > heartbeats {
                                self.with_client(|client| client.caught_up());
                            }
                        }
                        Err(err) => {
                            warn!(url = %self.display_url, error = %err, "malformed change feed");
                            return Outcome::Fatal(err.into());
                        }
                    }
                    if splitter.is_finished() {
                        break;
                    }
                }

                match splitter.finish() {
                    Ok(()) => {
                        backoff.reset();
                        if self.mode == FeedMode::OneShot {
                            Outcome::Done
                        } else {
                            debug!(url = %self.display_url, "continuous feed closed by server, reconnecting");
                            Outcome::Continue
                        }
                    }
                    Err(err) => Outcome::Retry(SyncError::transport_retryable(format!(
                        "change feed truncated: {err}"
                    ))),
                }
            }
        }
    }

    /// Forwards valid changes to the client and returns how many there were.
    fn deliver(&self, objects: Vec<Map<String, Value>>) -> usize {
        let mut changes = Vec::with_capacity(objects.len());
        for object in objects {
            match ChangeEntry::from_json(&object) {
                Ok(change) => {
                    *self.last_sequence.lock() = Some(change.seq.clone());
                    changes.push(change);
                }
                Err(err) => {
                    let change = Value::Object(object);
                    warn!(error = %err, change = %change, "discarding unparseable change");
                }
            }
        }
        let count = changes.len();
        if count > 0 {
            self.with_client(|client| client.received_changes(changes));
        }
        count
    }

    fn with_client(&self, f: impl FnOnce(&dyn ChangeTrackerClient)) {
        let client = self.client.lock().clone();
        if let Some(client) = client {
            f(client.as_ref());
        }
    }

    fn notify_stopped(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            debug!(url = %self.display_url, "change tracker stopped");
            client.tracker_stopped(self.error.lock().clone());
        }
    }
}
