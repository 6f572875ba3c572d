//! Connection state machine
//!
//! Single source of truth for what the VPN is doing. Validates every
//! transition against the transition table, keeps the live session in
//! lockstep with the `Connected` state and publishes a snapshot after each
//! committed change.

use crate::error::SessionError;
use crate::types::{ConnectionSession, ConnectionState, FailureReason, RequestSeq, SessionHandle, SessionStats, StateSnapshot};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Events that drive the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    ConnectRequested,
    DisconnectRequested,
    /// Engine confirmed a connect or a re-establish
    Established(SessionHandle),
    DisconnectConfirmed,
    EngineFailed(FailureReason),
    LinkLost,
    RetriesExhausted(FailureReason),
    ResetRequested,
    /// Drop an in-flight operation: superseded command or disconnect fallback
    Abort,
}

impl Trigger {
    /// Name used in conflict notices
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::ConnectRequested => "connect",
            Trigger::DisconnectRequested => "disconnect",
            Trigger::Established(_) => "confirm connection",
            Trigger::DisconnectConfirmed => "confirm disconnect",
            Trigger::EngineFailed(_) => "fail",
            Trigger::LinkLost => "report link loss",
            Trigger::RetriesExhausted(_) => "exhaust retries",
            Trigger::ResetRequested => "reset",
            Trigger::Abort => "abort",
        }
    }
}

/// Transition table
///
/// Returns the target state, or `None` when `trigger` is not accepted in
/// `current`.
pub fn next_state(current: &ConnectionState, trigger: &Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (current, trigger) {
        (Disconnected, Trigger::ConnectRequested) => Some(Connecting),
        (Connecting, Trigger::Established(_)) => Some(Connected),
        (Connecting, Trigger::EngineFailed(reason)) => Some(Failed(reason.clone())),
        (Connected, Trigger::DisconnectRequested) => Some(Disconnecting),
        (Connected, Trigger::LinkLost) => Some(Reconnecting),
        (Reconnecting, Trigger::Established(_)) => Some(Connected),
        (Reconnecting, Trigger::RetriesExhausted(reason)) => Some(Failed(reason.clone())),
        (Disconnecting, Trigger::DisconnectConfirmed) => Some(Disconnected),
        (Failed(_), Trigger::ResetRequested) => Some(Disconnected),
        (Connecting | Reconnecting | Disconnecting, Trigger::Abort) => Some(Disconnected),
        _ => None,
    }
}

/// Owner of the live connection state and session
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    session: Option<ConnectionSession>,
    seq: RequestSeq,
    publisher: watch::Sender<StateSnapshot>,
}

impl ConnectionStateMachine {
    /// Create a machine resting in `Disconnected`
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(StateSnapshot::default());
        Self {
            state: ConnectionState::Disconnected,
            session: None,
            seq: RequestSeq::default(),
            publisher,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Copy of the last committed state
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state.clone(),
            session: self.session.clone(),
            seq: self.seq,
        }
    }

    /// Receiver that observes every committed snapshot
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.publisher.subscribe()
    }

    /// Whether `trigger` would be accepted right now
    pub fn accepts(&self, trigger: &Trigger) -> bool {
        next_state(&self.state, trigger).is_some()
    }

    /// Validate and commit a transition
    ///
    /// On rejection nothing changes and the caller receives the current state.
    pub fn apply(&mut self, trigger: Trigger, seq: RequestSeq) -> Result<ConnectionState, SessionError> {
        let Some(target) = next_state(&self.state, &trigger) else {
            debug!(state = %self.state, trigger = trigger.name(), "Rejected transition");
            return Err(SessionError::StateConflict {
                current: self.state.clone(),
                requested: trigger.name().to_string(),
            });
        };

        // A session exists exactly while Connected
        self.session = match (&target, trigger) {
            (ConnectionState::Connected, Trigger::Established(handle)) => Some(ConnectionSession::new(handle)),
            _ => None,
        };

        match &target {
            ConnectionState::Failed(reason) => error!(from = %self.state, seq = %seq, "Connection failed: {}", reason),
            _ => info!(from = %self.state, to = %target, seq = %seq, "Connection state changed"),
        }

        self.state = target.clone();
        self.seq = seq;
        self.publish();
        Ok(target)
    }

    /// Update the live session's counters in place
    ///
    /// Ignored unless a session exists. Returns whether anything changed.
    pub fn record_statistics(&mut self, stats: &SessionStats) -> bool {
        match self.session.as_mut() {
            Some(session) if session.stats() != *stats => {
                session.record(stats);
                self.publish();
                true
            }
            _ => false,
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.snapshot());
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
