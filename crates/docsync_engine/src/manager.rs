//! Registry of replication sessions.
//!
//! A manager hands out at most one live session per (local store, remote
//! database, direction). Requests for a replication that already exists
//! return the existing session; a stopped session is replaced.

use crate::config::Direction;
use crate::error::SyncResult;
use crate::event::SessionId;
use crate::http::strip_credentials;
use crate::session::{ReplicationSession, SessionBuilder};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Identity of a replication within a manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Private identifier of the local store.
    pub store: String,
    /// Remote database URL without credentials.
    pub remote: String,
    /// Replication direction.
    pub direction: Direction,
}

#[derive(Default)]
pub(crate) struct Registry {
    sessions: Mutex<HashMap<SessionKey, ReplicationSession>>,
    active: Mutex<BTreeSet<SessionId>>,
}

impl Registry {
    pub(crate) fn register(&self, id: SessionId) {
        self.active.lock().insert(id);
    }

    pub(crate) fn unregister(&self, id: SessionId) {
        self.active.lock().remove(&id);
    }
}

/// Owner of the replication sessions of a process.
#[derive(Clone, Default)]
pub struct SessionManager {
    registry: Arc<Registry>,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for the builder's replication, creating it if
    /// there is none or the existing one has stopped.
    pub fn session(&self, builder: SessionBuilder) -> SyncResult<ReplicationSession> {
        let key = builder.key();
        let mut sessions = self.registry.sessions.lock();
        if let Some(existing) = sessions.get(&key) {
            if !existing.state().is_terminal() {
                return Ok(existing.clone());
            }
        }

        let session = builder.registry(Arc::downgrade(&self.registry)).build()?;
        debug!(session = %session.id(), remote = %key.remote, direction = ?key.direction, "created session");
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Looks up an existing session.
    pub fn get(&self, store: &str, remote: &url::Url, direction: Direction) -> Option<ReplicationSession> {
        let key = SessionKey {
            store: store.to_owned(),
            remote: strip_credentials(remote).to_string(),
            direction,
        };
        self.registry.sessions.lock().get(&key).cloned()
    }

    /// All sessions known to the manager.
    pub fn sessions(&self) -> Vec<ReplicationSession> {
        self.registry.sessions.lock().values().cloned().collect()
    }

    /// IDs of sessions between launch and stop.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.registry.active.lock().iter().copied().collect()
    }

    /// Drops a session from the registry. Returns true if it was registered.
    ///
    /// The session keeps running if it was running.
    pub fn forget(&self, session: &ReplicationSession) -> bool {
        let mut sessions = self.registry.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.id() != session.id());
        before != sessions.len()
    }

    /// Forgets every session of a local store that is closing.
    ///
    /// Each session saves its checkpoint and stops. Returns how many
    /// sessions were forgotten.
    pub fn forget_store(&self, store: &str) -> usize {
        let closing: Vec<ReplicationSession> = {
            let mut sessions = self.registry.sessions.lock();
            let keys: Vec<SessionKey> = sessions.keys().filter(|k| k.store == store).cloned().collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        for session in &closing {
            session.database_closing();
        }
        closing.len()
    }
}
