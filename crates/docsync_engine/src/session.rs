//! Replication sessions.
//!
//! A [`ReplicationSession`] is a cheap handle to a session actor: a tokio task
//! that owns all mutable session state and drains a command queue one
//! command at a time. Triggers, feed callbacks, batch flushes and request
//! completions are all posted to that queue, so state transitions, counters
//! and checkpoint bookkeeping never race. Network requests run as separate
//! tasks, bounded by a semaphore, and report back through the queue.

mod pull;
mod push;

use crate::auth::{Authenticator, SESSION_PATH};
use crate::batcher::Batcher;
use crate::checkpoint::{agreed_sequence, CheckpointState, RefreshOutcome, SaveAction, SaveOutcome, SaveRequest};
use crate::config::{Direction, ReplicationConfig};
use crate::error::{SyncError, SyncResult};
use crate::event::{ChangeEvent, ChangeListener, SessionId, StateTransition};
use crate::http::{db_url, embedded_credentials, masked, strip_credentials, HttpClient, HttpRequest, Method};
use crate::manager::{Registry, SessionKey};
use crate::state::{self, Hook, ReplicationState, ReplicationTrigger};
use crate::store::{LocalStore, StoreHandle};
use crate::tracker::ChangeTracker;
use docsync_protocol::{last_sequence_of, CheckpointSpec, PendingRevision, PutResponse, SessionInfo};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, trace, warn};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

const SYNC_GATEWAY_PREFIX: &str = "Couchbase Sync Gateway/";

type Completion = Box<dyn FnOnce(&mut Actor) + Send>;

enum Command {
    Fire(ReplicationTrigger),
    Complete(u64, Completion),
    Changes(u64, Vec<docsync_protocol::ChangeEntry>),
    TrackerStopped(u64, Option<SyncError>),
    CaughtUp(u64),
    LocalChanged(u64),
    ProcessBatch(Vec<PendingRevision>, oneshot::Sender<()>),
    Reachability(bool),
    DatabaseClosing,
}

#[derive(Debug, Default)]
struct Status {
    error: Option<SyncError>,
    last_sequence: Option<String>,
    server: Option<String>,
    changes_count: u64,
    completed_changes_count: u64,
    revisions_failed: u64,
}

struct Shared {
    id: SessionId,
    config: ReplicationConfig,
    checkpoint_id: String,
    http: Arc<dyn HttpClient>,
    status: RwLock<Status>,
    state: watch::Sender<ReplicationState>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    requests: Mutex<HashMap<u64, AbortHandle>>,
}

/// Handle to a replication session.
///
/// Every method returns immediately; triggers are queued and run on the
/// session task.
#[derive(Clone)]
pub struct ReplicationSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Collects what a session needs before it is spawned.
pub struct SessionBuilder {
    config: ReplicationConfig,
    store: Arc<dyn LocalStore>,
    http: Arc<dyn HttpClient>,
    authenticator: Option<Arc<dyn Authenticator>>,
    reachability: Option<watch::Receiver<bool>>,
    registry: Option<Weak<Registry>>,
}

impl SessionBuilder {
    /// Starts a builder for `config` between `store` and the remote reached
    /// through `http`.
    pub fn new(config: ReplicationConfig, store: Arc<dyn LocalStore>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            store,
            http,
            authenticator: None,
            reachability: None,
            registry: None,
        }
    }

    /// Sets the authenticator.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Subscribes the session to network reachability (`true` = online).
    pub fn reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub(crate) fn registry(mut self, registry: Weak<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn key(&self) -> SessionKey {
        SessionKey {
            store: self.store.private_identifier(),
            remote: strip_credentials(&self.config.remote).to_string(),
            direction: self.config.direction,
        }
    }

    /// Spawns the session task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> SyncResult<ReplicationSession> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SyncError::Configuration("replication sessions need a tokio runtime".into())
        })?;

        let config = self.config;
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let checkpoint_id = checkpoint_spec(&config, &self.store.private_identifier()).checkpoint_id();
        let (state, _) = watch::channel(ReplicationState::Initial);
        let http = self
            .authenticator
            .as_ref()
            .and_then(|auth| auth.http_client())
            .unwrap_or(self.http);
        let shared = Arc::new(Shared {
            id,
            checkpoint_id: checkpoint_id.clone(),
            http: http.clone(),
            status: RwLock::new(Status::default()),
            state,
            listeners: RwLock::new(Vec::new()),
            requests: Mutex::new(HashMap::new()),
            config,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(shared.config.request_pool_size.max(1)));

        let actor = Actor {
            shared: shared.clone(),
            commands: rx,
            handle: tx.downgrade(),
            state: ReplicationState::Initial,
            deferred: VecDeque::new(),
            events: VecDeque::new(),
            store: StoreHandle::new(self.store),
            http,
            authenticator: self.authenticator,
            registry: self.registry,
            reachability: self.reachability,
            reachability_task: None,
            semaphore,
            next_request: 0,
            checkpoint: CheckpointState::new(checkpoint_id),
            batcher: None,
            batches: HashMap::new(),
            next_batch: 0,
            pending_revisions: 0,
            generation: 0,
            transfer_ready: false,
            source_exhausted: false,
            source_sequence: None,
            revision_failed: false,
            tracker: None,
            push_cursor: 0,
            push_observer: None,
            final_save_requested: false,
            finalized: false,
        };
        runtime.spawn(actor.run());
        debug!(session = %id, remote = %masked(&shared.config.remote), "session created");

        Ok(ReplicationSession { shared, commands: tx })
    }
}

/// Builds the checkpoint identity of a replication.
pub fn checkpoint_spec(config: &ReplicationConfig, local_uuid: &str) -> CheckpointSpec {
    let mut spec = CheckpointSpec::new(
        local_uuid,
        strip_credentials(&config.remote).to_string(),
        config.direction.is_push(),
    );
    spec.continuous = config.continuous;
    spec.filter = config.filter.clone();
    spec.filter_params = config.filter_params.clone();
    spec.doc_ids = config.doc_ids.clone();
    spec
}

impl ReplicationSession {
    /// Creates a session outside of any manager.
    pub fn new(config: ReplicationConfig, store: Arc<dyn LocalStore>, http: Arc<dyn HttpClient>) -> SyncResult<Self> {
        SessionBuilder::new(config, store, http).build()
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Session configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.shared.config
    }

    /// Checkpoint document ID (`_local/{id}` on the remote).
    pub fn checkpoint_id(&self) -> &str {
        &self.shared.checkpoint_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicationState {
        *self.shared.state.borrow()
    }

    /// Watch channel of the lifecycle state.
    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    /// Waits until the session reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut states = self.subscribe_state();
        let _ = states.wait_for(|s| s.is_terminal()).await;
    }

    /// Last error reported by the session.
    pub fn error(&self) -> Option<SyncError> {
        self.shared.status.read().error.clone()
    }

    /// Sequence up to which everything has been transferred.
    pub fn last_sequence(&self) -> Option<String> {
        self.shared.status.read().last_sequence.clone()
    }

    /// Revisions discovered so far.
    pub fn changes_count(&self) -> u64 {
        self.shared.status.read().changes_count
    }

    /// Revisions processed so far, successfully or not.
    pub fn completed_changes_count(&self) -> u64 {
        self.shared.status.read().completed_changes_count
    }

    /// Revisions that failed to transfer.
    pub fn revisions_failed(&self) -> u64 {
        self.shared.status.read().revisions_failed
    }

    /// `Server` header reported by the remote.
    pub fn server_type(&self) -> Option<String> {
        self.shared.status.read().server.clone()
    }

    /// Returns true if the remote is a Sync Gateway of at least `min_version`.
    pub fn server_is_sync_gateway_version(&self, min_version: &str) -> bool {
        let status = self.shared.status.read();
        status
            .server
            .as_deref()
            .and_then(|server| server.strip_prefix(SYNC_GATEWAY_PREFIX))
            .is_some_and(|version| version_at_least(version, min_version))
    }

    /// Number of network requests in flight.
    pub fn pending_request_count(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Registers a listener for change events.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Fires a trigger. Ignored triggers have no effect.
    pub fn fire(&self, trigger: ReplicationTrigger) {
        self.post(Command::Fire(trigger));
    }

    /// Starts replicating.
    pub fn start(&self) {
        self.fire(ReplicationTrigger::Start);
    }

    /// Stops after draining pending work.
    pub fn stop(&self) {
        self.fire(ReplicationTrigger::StopGraceful);
    }

    /// Stops now, abandoning pending work.
    pub fn stop_immediately(&self) {
        self.fire(ReplicationTrigger::StopImmediate);
    }

    /// Suspends the transfer because the remote is unreachable.
    pub fn go_offline(&self) {
        self.fire(ReplicationTrigger::GoOffline);
    }

    /// Resumes the transfer.
    pub fn go_online(&self) {
        self.fire(ReplicationTrigger::GoOnline);
    }

    /// The local store is closing: save the checkpoint and stop.
    pub fn database_closing(&self) {
        self.post(Command::DatabaseClosing);
    }

    /// Sets a cookie for the remote on the shared HTTP client.
    ///
    /// Cookies are not private to this session.
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.shared.http.set_cookie(&self.shared.config.remote, name, value);
    }

    /// Deletes a cookie for the remote on the shared HTTP client.
    pub fn delete_cookie(&self, name: &str) {
        self.shared.http.delete_cookie(&self.shared.config.remote, name);
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!(session = %self.shared.id, "session task has exited; command dropped");
        }
    }
}

impl std::fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("id", &self.shared.id)
            .field("remote", &masked(&self.shared.config.remote))
            .field("direction", &self.shared.config.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Compares dotted version strings numerically, component by component.
fn version_at_least(version: &str, min: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split(|c: char| !c.is_ascii_digit())
            .take_while(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    };
    parse(version) >= parse(min)
}

struct BatchProgress {
    size: usize,
    last_sequence: Option<String>,
    outstanding: usize,
    done: Option<oneshot::Sender<()>>,
}

impl Shared {
    /// Records the `Server` header of a response, whatever its status.
    fn note_server(&self, server: Option<&str>) {
        let Some(server) = server else {
            return;
        };
        let mut status = self.status.write();
        if status.server.as_deref() != Some(server) {
            debug!(session = %self.id, server = %server, "remote server");
            status.server = Some(server.to_owned());
        }
    }
}

async fn send_json(shared: Arc<Shared>, http: Arc<dyn HttpClient>, request: HttpRequest) -> SyncResult<Value> {
    let response = http.send(request).await?;
    shared.note_server(response.header("server"));
    let body = response.error_for_status().await?.bytes().await?;
    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&body)?)
}

fn into_object(value: Value) -> SyncResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Protocol(format!("expected a JSON object, got {other}"))),
    }
}

struct Actor {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: mpsc::WeakUnboundedSender<Command>,
    state: ReplicationState,
    deferred: VecDeque<ReplicationTrigger>,
    events: VecDeque<ChangeEvent>,
    store: StoreHandle,
    http: Arc<dyn HttpClient>,
    authenticator: Option<Arc<dyn Authenticator>>,
    registry: Option<Weak<Registry>>,
    reachability: Option<watch::Receiver<bool>>,
    reachability_task: Option<JoinHandle<()>>,
    semaphore: Arc<Semaphore>,
    next_request: u64,
    checkpoint: CheckpointState,
    batcher: Option<Batcher<PendingRevision>>,
    batches: HashMap<u64, BatchProgress>,
    next_batch: u64,
    /// Revisions queued and not yet finished by a batch.
    pending_revisions: usize,
    /// Tags feed and observer callbacks; bumped whenever they are replaced.
    generation: u64,
    transfer_ready: bool,
    source_exhausted: bool,
    source_sequence: Option<String>,
    revision_failed: bool,
    tracker: Option<ChangeTracker>,
    push_cursor: u64,
    push_observer: Option<JoinHandle<()>>,
    final_save_requested: bool,
    finalized: bool,
}

impl Actor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
            while let Some(trigger) = self.deferred.pop_front() {
                self.fire(trigger);
            }
            if self.state == ReplicationState::Stopping {
                self.try_finish_graceful_stop();
                while let Some(trigger) = self.deferred.pop_front() {
                    self.fire(trigger);
                }
            }
            self.dispatch_events();
            if self.finalized {
                break;
            }
        }
        if !self.finalized {
            self.finalize();
        }
        debug!(session = %self.shared.id, "session task exiting");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Fire(trigger) => self.fire(trigger),
            Command::Complete(id, completion) => {
                self.shared.requests.lock().remove(&id);
                completion(self);
            }
            Command::Changes(generation, changes) => {
                if generation == self.generation {
                    self.received_changes(changes);
                }
            }
            Command::TrackerStopped(generation, error) => {
                if generation == self.generation {
                    self.tracker_stopped(error);
                }
            }
            Command::CaughtUp(generation) => {
                if generation == self.generation {
                    self.feed_caught_up();
                }
            }
            Command::LocalChanged(generation) => {
                if generation == self.generation {
                    self.queue_local_changes();
                }
            }
            Command::ProcessBatch(batch, done) => self.process_batch(batch, done),
            Command::Reachability(online) => {
                debug!(session = %self.shared.id, online, "reachability changed");
                self.fire(if online {
                    ReplicationTrigger::GoOnline
                } else {
                    ReplicationTrigger::GoOffline
                });
            }
            Command::DatabaseClosing => {
                info!(session = %self.shared.id, "local store closing");
                self.save_checkpoint();
                self.fire(ReplicationTrigger::StopGraceful);
            }
        }
    }

    fn fire(&mut self, trigger: ReplicationTrigger) {
        let Some(transition) = state::transition(self.state, trigger) else {
            trace!(session = %self.shared.id, state = %self.state, ?trigger, "trigger ignored");
            return;
        };
        info!(
            session = %self.shared.id,
            from = %transition.source,
            to = %transition.destination,
            ?trigger,
            "state transition"
        );
        self.state = transition.destination;
        self.shared.state.send_replace(transition.destination);

        let recorded = StateTransition::from(&transition);
        for hook in &transition.hooks {
            match hook {
                Hook::Launch => self.launch(),
                Hook::GoOffline => self.go_offline(),
                Hook::GoOnline => self.go_online(),
                Hook::StopGraceful => self.begin_graceful_stop(),
                Hook::Finalize => self.finalize(),
                Hook::Notify => self.queue_event(Some(recorded), None),
            }
        }
    }

    /// Queues a trigger to run after the current command.
    fn defer(&mut self, trigger: ReplicationTrigger) {
        self.deferred.push_back(trigger);
    }

    fn queue_event(&mut self, transition: Option<StateTransition>, error: Option<SyncError>) {
        let status = self.shared.status.read();
        self.events.push_back(ChangeEvent {
            session: self.shared.id,
            state: self.state,
            transition,
            error,
            changes_count: status.changes_count,
            completed_changes_count: status.completed_changes_count,
        });
    }

    fn dispatch_events(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let listeners = self.shared.listeners.read().clone();
        while let Some(event) = self.events.pop_front() {
            for listener in &listeners {
                listener.changed(&event);
            }
        }
    }

    fn set_error(&mut self, err: SyncError) {
        error!(session = %self.shared.id, error = %err, "session error");
        self.shared.status.write().error = Some(err.clone());
        self.queue_event(None, Some(err));
    }

    fn add_changes_count(&mut self, delta: usize) {
        self.shared.status.write().changes_count += delta as u64;
        self.queue_event(None, None);
    }

    fn add_completed_changes_count(&mut self, delta: usize) {
        self.shared.status.write().completed_changes_count += delta as u64;
        self.queue_event(None, None);
    }

    fn record_revision_failure(&mut self, revision: &PendingRevision, err: SyncError) {
        warn!(
            session = %self.shared.id,
            doc = %revision.doc_id,
            rev = %revision.rev_id,
            error = %err,
            "revision failed"
        );
        self.revision_failed = true;
        self.shared.status.write().revisions_failed += 1;
        self.set_error(err);
    }

    fn last_sequence(&self) -> Option<String> {
        self.shared.status.read().last_sequence.clone()
    }

    fn set_last_sequence(&mut self, sequence: Option<String>) {
        trace!(session = %self.shared.id, seq = ?sequence, "last sequence");
        self.shared.status.write().last_sequence = sequence;
    }

    // Requests.

    fn request(&self, method: Method, segments: &[&str]) -> SyncResult<HttpRequest> {
        let url = db_url(&strip_credentials(&self.shared.config.remote), segments)?;
        Ok(self.decorate(HttpRequest::new(method, url)))
    }

    fn decorate(&self, mut request: HttpRequest) -> HttpRequest {
        for (name, value) in &self.shared.config.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        if let Some((user, password)) = embedded_credentials(&self.shared.config.remote) {
            request = request.with_basic_auth(user, password);
        }
        match &self.authenticator {
            Some(auth) => auth.decorate(request),
            None => request,
        }
    }

    /// Runs `work` on the request pool and `done` on the session task.
    fn spawn_request<T, Fut, F>(&mut self, work: Fut, done: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(&mut Actor, T) + Send + 'static,
    {
        let Some(tx) = self.handle.upgrade() else {
            return;
        };
        let id = self.next_request;
        self.next_request += 1;
        let permits = self.semaphore.clone();
        let task = tokio::spawn(async move {
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };
            let value = work.await;
            drop(permit);
            let completion: Completion = Box::new(move |actor: &mut Actor| done(actor, value));
            let _ = tx.send(Command::Complete(id, completion));
        });
        self.shared.requests.lock().insert(id, task.abort_handle());
    }

    fn send<F>(&mut self, request: HttpRequest, done: F)
    where
        F: FnOnce(&mut Actor, SyncResult<Value>) + Send + 'static,
    {
        trace!(session = %self.shared.id, method = request.method.as_str(), url = %request.url, "sending request");
        let http = self.http.clone();
        self.spawn_request(send_json(self.shared.clone(), http, request), done);
    }

    fn abort_requests(&mut self) {
        let requests: Vec<AbortHandle> = self.shared.requests.lock().drain().map(|(_, h)| h).collect();
        for request in requests {
            request.abort();
        }
    }

    // Launch.

    fn launch(&mut self) {
        if let Err(err) = self.establish() {
            self.set_error(err);
            self.defer(ReplicationTrigger::StopImmediate);
        }
    }

    fn establish(&mut self) -> SyncResult<()> {
        let store = self.store.get_unchecked().ok_or(SyncError::StoreClosed)?;
        store.open_if_needed()?;
        if !store.is_open() {
            return Err(SyncError::StoreClosed);
        }
        // Fail on a remote that cannot carry database paths before doing
        // anything else.
        db_url(&self.shared.config.remote, &[])?;

        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.register(self.shared.id);
        }

        let handle = self.handle.clone();
        self.batcher = Some(Batcher::new(self.shared.config.batcher, move |batch| {
            let handle = handle.clone();
            async move {
                let Some(tx) = handle.upgrade() else {
                    return;
                };
                let (done, finished) = oneshot::channel();
                if tx.send(Command::ProcessBatch(batch, done)).is_err() {
                    return;
                }
                drop(tx);
                let _ = finished.await;
            }
        }));

        self.revision_failed = false;
        self.watch_reachability();

        match &self.authenticator {
            Some(auth) if auth.uses_session_login() => self.check_session(false),
            _ => self.fetch_checkpoint(),
        }
        Ok(())
    }

    fn watch_reachability(&mut self) {
        let Some(mut reachability) = self.reachability.take() else {
            return;
        };
        let handle = self.handle.clone();
        self.reachability_task = Some(tokio::spawn(async move {
            loop {
                let online = *reachability.borrow_and_update();
                let Some(tx) = handle.upgrade() else {
                    break;
                };
                if tx.send(Command::Reachability(online)).is_err() {
                    break;
                }
                drop(tx);
                if reachability.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    fn check_session(&mut self, at_server_root: bool) {
        let request = if at_server_root {
            let mut url = strip_credentials(&self.shared.config.remote);
            url.set_path("/_session");
            url.set_query(None);
            Ok(self.decorate(HttpRequest::get(url)))
        } else {
            self.request(Method::Get, &[SESSION_PATH])
        };
        match request {
            Ok(request) => self.send(request, move |actor, result| {
                actor.session_checked(at_server_root, result)
            }),
            Err(err) => self.launch_failed(err),
        }
    }

    fn session_checked(&mut self, at_server_root: bool, result: SyncResult<Value>) {
        if !self.state.is_running() {
            return;
        }
        match result {
            Err(err) if !at_server_root && matches!(err.status(), Some(400 | 404)) => {
                debug!(session = %self.shared.id, "no database session endpoint, trying server root");
                self.check_session(true);
            }
            Err(err) => self.launch_failed(err),
            Ok(body) => {
                let info: SessionInfo = match serde_json::from_value(body) {
                    Ok(info) => info,
                    Err(err) => return self.launch_failed(err.into()),
                };
                match info.user_name() {
                    Some(name) => {
                        debug!(session = %self.shared.id, user = %name, "active session");
                        self.fetch_checkpoint();
                    }
                    None => {
                        debug!(session = %self.shared.id, "no active session, logging in");
                        self.login();
                    }
                }
            }
        }
    }

    fn login(&mut self) {
        let Some(auth) = self.authenticator.clone() else {
            return self.fetch_checkpoint();
        };
        let remote = &self.shared.config.remote;
        let Some(parameters) = auth.login_parameters(remote) else {
            debug!(session = %self.shared.id, "authenticator has no login parameters, skipping login");
            return self.fetch_checkpoint();
        };
        let path = auth.login_path(remote).unwrap_or_else(|| SESSION_PATH.to_owned());
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let request = self.request(Method::Post, &segments).map(|request| {
            request
                .with_header("Content-Type", "application/json")
                .with_body(Value::Object(parameters).to_string().into())
        });
        match request {
            Ok(request) => self.send(request, |actor, result| match result {
                Ok(_) => {
                    info!(session = %actor.shared.id, "logged in");
                    actor.fetch_checkpoint();
                }
                Err(err) => actor.launch_failed(SyncError::AuthenticationFailed(err.to_string())),
            }),
            Err(err) => self.launch_failed(err),
        }
    }

    /// Reports an error during session setup and stops gracefully.
    fn launch_failed(&mut self, err: SyncError) {
        self.set_error(err);
        self.defer(ReplicationTrigger::StopGraceful);
    }

    // Checkpoints.

    fn fetch_checkpoint(&mut self) {
        if !self.state.is_running() {
            return;
        }
        let id = self.checkpoint.id().to_owned();
        match self.request(Method::Get, &["_local", &id]) {
            Ok(request) => self.send(request, |actor, result| actor.checkpoint_fetched(result)),
            Err(err) => self.launch_failed(err),
        }
    }

    fn checkpoint_fetched(&mut self, result: SyncResult<Value>) {
        if !self.state.is_running() {
            return;
        }
        let (remote, missing) = match result.and_then(into_object) {
            Ok(remote) => (Some(remote), false),
            Err(err) if err.is_not_found() => (None, true),
            Err(err) => {
                warn!(session = %self.shared.id, error = %err, "checkpoint fetch failed");
                return self.launch_failed(err);
            }
        };

        let remote_sequence = remote.as_ref().and_then(last_sequence_of);
        self.checkpoint.set_remote(remote);

        let local_sequence = match self.store.get().and_then(|store| {
            store.read_last_sequence(self.checkpoint.id(), self.shared.config.direction)
        }) {
            Ok(sequence) => sequence,
            Err(err) => return self.launch_failed(err),
        };

        let since = agreed_sequence(remote_sequence.as_deref(), local_sequence.as_deref());
        if since.is_none() && (remote_sequence.is_some() || local_sequence.is_some()) {
            info!(
                session = %self.shared.id,
                remote = ?remote_sequence,
                local = ?local_sequence,
                "checkpoints disagree, replicating from the start"
            );
        }
        debug!(session = %self.shared.id, checkpoint = %self.checkpoint.id(), since = ?since, "checkpoint fetched");
        self.checkpoint.set_last_saved(since.clone());
        self.set_last_sequence(since);

        let config = &self.shared.config;
        if missing && config.direction == Direction::Push && config.create_target {
            self.create_target();
        } else {
            self.transfer_ready = true;
            self.begin_replicating();
        }
    }

    fn create_target(&mut self) {
        info!(session = %self.shared.id, remote = %masked(&self.shared.config.remote), "creating remote database");
        match self.request(Method::Put, &[]) {
            Ok(request) => self.send(request, |actor, result| match result {
                Ok(_) => actor.target_ready(),
                Err(err) if err.status() == Some(412) => actor.target_ready(),
                Err(err) => actor.launch_failed(err),
            }),
            Err(err) => self.launch_failed(err),
        }
    }

    fn target_ready(&mut self) {
        if !self.state.is_running() {
            return;
        }
        self.transfer_ready = true;
        self.begin_replicating();
    }

    fn save_checkpoint(&mut self) {
        let current = self.last_sequence();
        let action = self.checkpoint.request_save(current.as_deref());
        self.apply_save_action(action);
    }

    fn apply_save_action(&mut self, action: SaveAction) {
        match action {
            SaveAction::None => {}
            SaveAction::Deferred => {
                trace!(session = %self.shared.id, "checkpoint save already in flight");
            }
            SaveAction::Save(save) => {
                let request = self
                    .request(Method::Put, &["_local", &save.checkpoint_id])
                    .map(|request| {
                        request
                            .with_header("Content-Type", "application/json")
                            .with_body(Value::Object(save.body.clone()).to_string().into())
                    });
                match request {
                    Ok(request) => {
                        debug!(session = %self.shared.id, seq = %save.last_sequence, "saving checkpoint");
                        self.send(request, move |actor, result| actor.checkpoint_saved(save, result));
                    }
                    Err(err) => {
                        warn!(session = %self.shared.id, error = %err, "cannot build checkpoint request");
                        let action = self.checkpoint.save_finished(SaveOutcome::Failed, None);
                        self.apply_save_action(action);
                    }
                }
            }
            SaveAction::Refresh => {
                let id = self.checkpoint.id().to_owned();
                match self.request(Method::Get, &["_local", &id]) {
                    Ok(request) => self.send(request, |actor, result| {
                        let outcome = match result.and_then(into_object) {
                            Ok(remote) => RefreshOutcome::Found(remote),
                            Err(err) if err.is_not_found() => RefreshOutcome::NotFound,
                            Err(err) => {
                                warn!(session = %actor.shared.id, error = %err, "checkpoint refresh failed");
                                RefreshOutcome::Failed
                            }
                        };
                        let current = actor.last_sequence();
                        let action = actor.checkpoint.refreshed(outcome, current.as_deref());
                        actor.apply_save_action(action);
                    }),
                    Err(err) => {
                        warn!(session = %self.shared.id, error = %err, "cannot build checkpoint request");
                        let action = self.checkpoint.refreshed(RefreshOutcome::Failed, None);
                        self.apply_save_action(action);
                    }
                }
            }
        }
    }

    fn checkpoint_saved(&mut self, save: SaveRequest, result: SyncResult<Value>) {
        let outcome = match result.and_then(|body| Ok(serde_json::from_value::<PutResponse>(body)?)) {
            Ok(response) => {
                let written = self.store.get().and_then(|store| {
                    store.write_last_sequence(&save.checkpoint_id, self.shared.config.direction, &save.last_sequence)
                });
                if let Err(err) = written {
                    warn!(session = %self.shared.id, error = %err, "cannot record last sequence locally");
                }
                debug!(session = %self.shared.id, seq = %save.last_sequence, rev = %response.rev, "checkpoint saved");
                SaveOutcome::Saved { rev: response.rev }
            }
            Err(err) if err.is_conflict() => {
                debug!(session = %self.shared.id, "checkpoint conflict, refreshing");
                SaveOutcome::Conflict
            }
            Err(err) if err.is_not_found() => {
                debug!(session = %self.shared.id, "remote checkpoint is gone");
                SaveOutcome::NotFound
            }
            Err(err) => {
                warn!(session = %self.shared.id, error = %err, "checkpoint save failed");
                SaveOutcome::Failed
            }
        };
        let current = self.last_sequence();
        let action = self.checkpoint.save_finished(outcome, current.as_deref());
        self.apply_save_action(action);
    }

    // Transfer.

    fn begin_replicating(&mut self) {
        if !self.transfer_ready || self.state == ReplicationState::Offline || !self.state.is_running() {
            return;
        }
        self.source_exhausted = false;
        match self.shared.config.direction {
            Direction::Pull => self.start_pull(),
            Direction::Push => self.start_push(),
        }
    }

    fn stop_sources(&mut self) {
        self.generation += 1;
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        if let Some(observer) = self.push_observer.take() {
            observer.abort();
        }
    }

    fn queue_revisions(&mut self, revisions: Vec<PendingRevision>) {
        let allowed: Vec<PendingRevision> = match &self.shared.config.doc_ids {
            Some(ids) => revisions.into_iter().filter(|r| ids.contains(&r.doc_id)).collect(),
            None => revisions,
        };
        if allowed.is_empty() {
            if self.pending_revisions == 0 && self.batches.is_empty() {
                self.advance_to_source();
                self.check_completion();
            }
            return;
        }
        self.add_changes_count(allowed.len());
        self.pending_revisions += allowed.len();
        if let Some(batcher) = &self.batcher {
            batcher.queue_all(allowed);
        }
    }

    /// Moves the checkpoint to the latest source sequence when nothing is
    /// left to transfer.
    fn advance_to_source(&mut self) {
        if self.revision_failed {
            return;
        }
        if let Some(sequence) = self.source_sequence.clone() {
            if self.last_sequence().as_deref() != Some(sequence.as_str()) {
                self.set_last_sequence(Some(sequence));
                self.save_checkpoint();
            }
        }
    }

    fn process_batch(&mut self, batch: Vec<PendingRevision>, done: oneshot::Sender<()>) {
        if self.finalized {
            return;
        }
        let id = self.next_batch;
        self.next_batch += 1;
        trace!(session = %self.shared.id, batch = id, size = batch.len(), "processing batch");
        self.batches.insert(
            id,
            BatchProgress {
                size: batch.len(),
                last_sequence: batch.iter().rev().find_map(|r| r.sequence.clone()),
                outstanding: 0,
                done: Some(done),
            },
        );
        match self.shared.config.direction {
            Direction::Pull => self.process_pull_batch(id, batch),
            Direction::Push => self.process_push_batch(id, batch),
        }
    }

    fn finish_batch(&mut self, id: u64) {
        let Some(batch) = self.batches.remove(&id) else {
            return;
        };
        self.pending_revisions = self.pending_revisions.saturating_sub(batch.size);
        trace!(session = %self.shared.id, batch = id, pending = self.pending_revisions, "batch finished");

        if !self.revision_failed {
            let drained = self.pending_revisions == 0 && self.batches.is_empty();
            let sequence = if drained {
                self.source_sequence.clone().or(batch.last_sequence)
            } else {
                batch.last_sequence
            };
            if let Some(sequence) = sequence {
                self.set_last_sequence(Some(sequence));
                self.save_checkpoint();
            }
        }
        if let Some(done) = batch.done {
            let _ = done.send(());
        }
        self.check_completion();
    }

    fn check_completion(&mut self) {
        if self.pending_revisions > 0 || !self.batches.is_empty() {
            return;
        }
        match self.state {
            ReplicationState::Running => {
                if self.shared.config.continuous {
                    self.defer(ReplicationTrigger::WaitingForChanges);
                } else if self.source_exhausted {
                    debug!(session = %self.shared.id, "replication complete");
                    self.save_checkpoint();
                    self.defer(ReplicationTrigger::StopGraceful);
                }
            }
            ReplicationState::Stopping => self.try_finish_graceful_stop(),
            _ => {}
        }
    }

    // Offline / online.

    fn go_offline(&mut self) {
        info!(session = %self.shared.id, "going offline");
        self.stop_sources();
    }

    fn go_online(&mut self) {
        info!(session = %self.shared.id, "going online");
        self.begin_replicating();
    }

    // Stopping.

    fn begin_graceful_stop(&mut self) {
        self.stop_sources();
        if let Some(batcher) = &self.batcher {
            batcher.flush();
        }
        self.try_finish_graceful_stop();
    }

    fn try_finish_graceful_stop(&mut self) {
        if self.state != ReplicationState::Stopping {
            return;
        }
        if self.pending_revisions > 0 || !self.batches.is_empty() || self.checkpoint.is_saving() {
            return;
        }
        if !self.final_save_requested {
            self.final_save_requested = true;
            self.save_checkpoint();
            if self.checkpoint.is_saving() {
                return;
            }
        }
        if !self.deferred.contains(&ReplicationTrigger::StopImmediate) {
            self.defer(ReplicationTrigger::StopImmediate);
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.stop_sources();
        if let Some(batcher) = self.batcher.take() {
            batcher.shutdown();
        }
        self.batches.clear();
        self.pending_revisions = 0;
        self.abort_requests();
        if let Some(task) = self.reachability_task.take() {
            task.abort();
        }

        if let Some(sequence) = self.last_sequence() {
            if let Some(store) = self.store.get_unchecked() {
                if let Err(err) =
                    store.write_last_sequence(self.checkpoint.id(), self.shared.config.direction, &sequence)
                {
                    warn!(session = %self.shared.id, error = %err, "cannot record final sequence");
                }
            }
        }
        self.store.revoke();

        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.unregister(self.shared.id);
        }
        self.finalized = true;
        let (completed, failed) = {
            let status = self.shared.status.read();
            (status.completed_changes_count, status.revisions_failed)
        };
        info!(session = %self.shared.id, completed, failed, "session stopped");
    }
}
