//! Change events delivered to session listeners.

use crate::error::SyncError;
use crate::state::{ReplicationState, ReplicationTrigger, Transition};
use std::fmt;

/// Process-unique session identifier, displayed as `repl001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repl{:03}", self.0)
    }
}

/// A state change recorded in an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// State left.
    pub source: ReplicationState,
    /// State entered.
    pub destination: ReplicationState,
    /// Trigger that caused the change.
    pub trigger: ReplicationTrigger,
}

impl From<&Transition> for StateTransition {
    fn from(t: &Transition) -> Self {
        Self {
            source: t.source,
            destination: t.destination,
            trigger: t.trigger,
        }
    }
}

/// Snapshot of a session when something observable changed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Session that produced the event.
    pub session: SessionId,
    /// State when the event was produced.
    pub state: ReplicationState,
    /// Set for state-transition events.
    pub transition: Option<StateTransition>,
    /// Set for error events.
    pub error: Option<SyncError>,
    /// Revisions discovered so far.
    pub changes_count: u64,
    /// Revisions processed so far.
    pub completed_changes_count: u64,
}

/// Receives change events on the session's own task.
///
/// Listeners must not block. Any closure `Fn(&ChangeEvent)` is a listener.
pub trait ChangeListener: Send + Sync {
    /// Called for every event, in the order the session produced them.
    fn changed(&self, event: &ChangeEvent);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn changed(&self, event: &ChangeEvent) {
        self(event)
    }
}
