//! Replication lifecycle state machine.
//!
//! The machine is a pure lookup: [`transition`] maps a state and a trigger
//! to the destination and the ordered hooks the session must run. Pairs
//! missing from the table are ignored; they never produce an error or a
//! notification.
//!
//! ```text
//! Initial  --Start------------> Running
//! Running  --WaitingForChanges> Idle
//! Running  --GoOffline--------> Offline
//! Running  --StopGraceful-----> Stopping
//! Running  --StopImmediate----> Stopped
//! Offline  --GoOnline---------> Running
//! Stopping --StopImmediate----> Stopped
//! ```
//!
//! `Idle` and `Offline` are substates of `Running` and inherit its
//! transitions, except that `Idle` ignores `WaitingForChanges` and `Offline`
//! ignores `WaitingForChanges` and `GoOffline`.

use std::fmt;

/// The lifecycle state of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    /// Created, not yet started.
    Initial,
    /// Transferring revisions.
    Running,
    /// Running with no pending work (continuous sessions only).
    Idle,
    /// Running but the remote is unreachable.
    Offline,
    /// Draining pending work before stopping.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ReplicationState {
    /// All states, in declaration order.
    pub const ALL: [ReplicationState; 6] = [
        ReplicationState::Initial,
        ReplicationState::Running,
        ReplicationState::Idle,
        ReplicationState::Offline,
        ReplicationState::Stopping,
        ReplicationState::Stopped,
    ];

    /// The composite state this state is nested in.
    pub fn parent(&self) -> Option<ReplicationState> {
        match self {
            ReplicationState::Idle | ReplicationState::Offline => Some(ReplicationState::Running),
            _ => None,
        }
    }

    /// Returns true for `Running` and its substates.
    pub fn is_running(&self) -> bool {
        *self == ReplicationState::Running || self.parent() == Some(ReplicationState::Running)
    }

    /// Returns true if no trigger leaves this state.
    pub fn is_terminal(&self) -> bool {
        *self == ReplicationState::Stopped
    }

    /// Stable lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Initial => "initial",
            ReplicationState::Running => "running",
            ReplicationState::Idle => "idle",
            ReplicationState::Offline => "offline",
            ReplicationState::Stopping => "stopping",
            ReplicationState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests fired at the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationTrigger {
    /// Begin replicating.
    Start,
    /// The remote became unreachable.
    GoOffline,
    /// The remote became reachable again.
    GoOnline,
    /// No more work is pending.
    WaitingForChanges,
    /// Stop after draining pending work.
    StopGraceful,
    /// Stop now.
    StopImmediate,
}

impl ReplicationTrigger {
    /// All triggers, in declaration order.
    pub const ALL: [ReplicationTrigger; 6] = [
        ReplicationTrigger::Start,
        ReplicationTrigger::GoOffline,
        ReplicationTrigger::GoOnline,
        ReplicationTrigger::WaitingForChanges,
        ReplicationTrigger::StopGraceful,
        ReplicationTrigger::StopImmediate,
    ];
}

/// Side effects of an accepted transition, run in order by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Establish the session and begin the transfer.
    Launch,
    /// Abort the feed or push observer.
    GoOffline,
    /// Restart the transfer from the current sequence.
    GoOnline,
    /// Drain pending work, then fire `StopImmediate`.
    StopGraceful,
    /// Persist the final checkpoint and release the local store.
    Finalize,
    /// Deliver a state-transition event to listeners.
    Notify,
}

/// An accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the trigger.
    pub source: ReplicationState,
    /// State after the trigger.
    pub destination: ReplicationState,
    /// The trigger that caused it.
    pub trigger: ReplicationTrigger,
    /// Hooks to run: exit hooks of the left state, then entry hooks.
    pub hooks: Vec<Hook>,
}

fn permitted(state: ReplicationState, trigger: ReplicationTrigger) -> Option<ReplicationState> {
    use ReplicationState as S;
    use ReplicationTrigger as T;
    match (state, trigger) {
        (S::Initial, T::Start) => Some(S::Running),
        (S::Running, T::WaitingForChanges) => Some(S::Idle),
        (S::Running, T::StopImmediate) => Some(S::Stopped),
        (S::Running, T::StopGraceful) => Some(S::Stopping),
        (S::Running, T::GoOffline) => Some(S::Offline),
        (S::Offline, T::GoOnline) => Some(S::Running),
        (S::Stopping, T::StopImmediate) => Some(S::Stopped),
        _ => None,
    }
}

fn ignored(state: ReplicationState, trigger: ReplicationTrigger) -> bool {
    use ReplicationState as S;
    use ReplicationTrigger as T;
    matches!(
        (state, trigger),
        (S::Idle, T::WaitingForChanges | T::Start | T::GoOnline)
            | (S::Offline, T::WaitingForChanges | T::GoOffline | T::Start)
    )
}

fn destination(state: ReplicationState, trigger: ReplicationTrigger) -> Option<ReplicationState> {
    if let Some(to) = permitted(state, trigger) {
        return Some(to);
    }
    if ignored(state, trigger) {
        return None;
    }
    state.parent().and_then(|parent| permitted(parent, trigger))
}

/// Looks up the transition for `trigger` in `state`.
///
/// Returns `None` if the trigger is ignored in that state.
pub fn transition(state: ReplicationState, trigger: ReplicationTrigger) -> Option<Transition> {
    let to = destination(state, trigger)?;
    let mut hooks = Vec::new();

    // Exit hooks.
    match state {
        ReplicationState::Idle => hooks.push(Hook::Notify),
        ReplicationState::Offline => {
            if to == ReplicationState::Running {
                hooks.push(Hook::GoOnline);
            }
            hooks.push(Hook::Notify);
        }
        _ => {}
    }

    // Entry hooks. Moving between `Running` and its own substates does not
    // re-enter `Running`.
    match to {
        ReplicationState::Running if state == ReplicationState::Initial => {
            hooks.push(Hook::Launch);
            hooks.push(Hook::Notify);
        }
        ReplicationState::Idle => hooks.push(Hook::Notify),
        ReplicationState::Offline => {
            hooks.push(Hook::GoOffline);
            hooks.push(Hook::Notify);
        }
        ReplicationState::Stopping => {
            hooks.push(Hook::StopGraceful);
            hooks.push(Hook::Notify);
        }
        ReplicationState::Stopped => {
            hooks.push(Hook::Finalize);
            hooks.push(Hook::Notify);
        }
        _ => {}
    }

    Some(Transition {
        source: state,
        destination: to,
        trigger,
        hooks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplicationState as S;
    use ReplicationTrigger as T;

    const TABLE: [(S, T, S); 12] = [
        (S::Initial, T::Start, S::Running),
        (S::Running, T::WaitingForChanges, S::Idle),
        (S::Running, T::StopImmediate, S::Stopped),
        (S::Running, T::StopGraceful, S::Stopping),
        (S::Running, T::GoOffline, S::Offline),
        (S::Offline, T::GoOnline, S::Running),
        (S::Stopping, T::StopImmediate, S::Stopped),
        // Inherited from `Running`.
        (S::Idle, T::StopImmediate, S::Stopped),
        (S::Idle, T::StopGraceful, S::Stopping),
        (S::Idle, T::GoOffline, S::Offline),
        (S::Offline, T::StopImmediate, S::Stopped),
        (S::Offline, T::StopGraceful, S::Stopping),
    ];

    fn in_table(state: S, trigger: T) -> Option<S> {
        TABLE
            .iter()
            .find(|(s, t, _)| *s == state && *t == trigger)
            .map(|(_, _, to)| *to)
    }

    #[test]
    fn table_is_exact() {
        for state in S::ALL {
            for trigger in T::ALL {
                let result = transition(state, trigger);
                match in_table(state, trigger) {
                    Some(to) => {
                        let accepted = result.unwrap();
                        assert_eq!(accepted.destination, to, "{state} + {trigger:?}");
                        assert!(accepted.hooks.contains(&Hook::Notify));
                    }
                    None => assert!(result.is_none(), "{state} + {trigger:?} must be ignored"),
                }
            }
        }
    }

    #[test]
    fn stopped_is_terminal() {
        for trigger in T::ALL {
            assert!(transition(S::Stopped, trigger).is_none());
        }
        assert!(S::Stopped.is_terminal());
    }

    #[test]
    fn launch_only_from_initial() {
        let start = transition(S::Initial, T::Start).unwrap();
        assert_eq!(start.hooks, vec![Hook::Launch, Hook::Notify]);

        let resume = transition(S::Offline, T::GoOnline).unwrap();
        assert_eq!(resume.destination, S::Running);
        assert_eq!(resume.hooks, vec![Hook::GoOnline, Hook::Notify]);
    }

    #[test]
    fn exit_hooks_run_before_entry_hooks() {
        let t = transition(S::Idle, T::StopGraceful).unwrap();
        assert_eq!(t.hooks, vec![Hook::Notify, Hook::StopGraceful, Hook::Notify]);

        // Leaving `Offline` for a stop does not restart the transfer.
        let t = transition(S::Offline, T::StopImmediate).unwrap();
        assert_eq!(t.hooks, vec![Hook::Notify, Hook::Finalize, Hook::Notify]);

        let t = transition(S::Running, T::GoOffline).unwrap();
        assert_eq!(t.hooks, vec![Hook::GoOffline, Hook::Notify]);
    }

    #[test]
    fn substates() {
        assert_eq!(S::Idle.parent(), Some(S::Running));
        assert_eq!(S::Offline.parent(), Some(S::Running));
        assert_eq!(S::Stopping.parent(), None);
        assert!(S::Idle.is_running());
        assert!(!S::Stopping.is_running());
    }
}
