//! Command dispatcher
//!
//! Accepts UI commands, assigns each a sequence number and forwards it to
//! the engine through the retry supervisor. At most one command is in
//! flight; a newer command supersedes the pending one. Replies are applied
//! to the state machine only while their sequence number is still current.

use crate::bridge::relay::BridgeEvent;
use crate::bridge::state::{ConnectionStateMachine, Trigger};
use crate::bridge::supervisor::{Outcome, RetrySupervisor};
use crate::error::{EngineError, SessionError};
use crate::types::{
    Command, ConnectionRequest, ConnectionState, ProtocolOptions, RequestSeq, SessionStats, StateSnapshot,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Superseded commands remembered for stale-reply diagnostics
const RETIRED_LIMIT: usize = 16;

/// What a command resolved into
pub type CommandResult = Result<ConnectionState, SessionError>;

/// Shared cancellation flag of one pending command
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine work a pending command stands for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Connect(ConnectionRequest),
    Disconnect,
    /// Disconnect phase followed by a connect to the new node
    Switch(ConnectionRequest),
    /// Autonomous reconnect started by the supervisor
    Reconnect(ConnectionRequest),
}

/// Observable description of a pending or superseded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommandInfo {
    pub seq: RequestSeq,
    pub intent: Intent,
    pub issued_at: DateTime<Utc>,
    pub cancelled: bool,
}

struct PendingCommand {
    info: PendingCommandInfo,
    cancel: CancelToken,
    completion: Option<oneshot::Sender<CommandResult>>,
}

/// Caller's view of a submitted command
#[derive(Debug)]
pub struct RequestHandle {
    seq: RequestSeq,
    rx: oneshot::Receiver<CommandResult>,
}

impl RequestHandle {
    fn ready(seq: RequestSeq, result: CommandResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { seq, rx }
    }

    pub fn seq(&self) -> RequestSeq {
        self.seq
    }

    /// Wait for the command to resolve
    pub async fn wait(self) -> CommandResult {
        self.rx.await.unwrap_or(Err(SessionError::Closed))
    }
}

/// Reconnect registered as the pending command
pub(crate) struct RecoveryJob {
    pub seq: RequestSeq,
    pub request: ConnectionRequest,
    pub cancel: CancelToken,
}

struct Inner {
    machine: ConnectionStateMachine,
    pending: Option<PendingCommand>,
    retired: VecDeque<PendingCommandInfo>,
    last_seq: RequestSeq,
    last_request: Option<ConnectionRequest>,
    last_node: Option<String>,
}

impl Inner {
    /// Cancel the pending command in favour of `seq`
    ///
    /// Returns whether anything was superseded. The machine rolls back to
    /// `Disconnected` so the new command starts from a resting state.
    fn supersede(&mut self, seq: RequestSeq) -> bool {
        let Some(mut old) = self.pending.take() else {
            return false;
        };

        old.cancel.cancel();
        old.info.cancelled = true;
        info!(superseded = %old.info.seq, by = %seq, "Pending command superseded");

        if let Some(tx) = old.completion.take() {
            let _ = tx.send(Err(SessionError::Superseded { seq: old.info.seq }));
        }
        if self.machine.accepts(&Trigger::Abort) {
            let _ = self.machine.apply(Trigger::Abort, seq);
        }

        self.retired.push_back(old.info);
        if self.retired.len() > RETIRED_LIMIT {
            self.retired.pop_front();
        }
        true
    }

    fn is_current(&self, seq: RequestSeq) -> bool {
        self.pending.as_ref().map(|p| p.info.seq) == Some(seq)
    }

    fn discard(&self, seq: RequestSeq, reply: &str) {
        let cancelled = self.retired.iter().any(|info| info.seq == seq);
        debug!(seq = %seq, reply, cancelled, "Discarding stale engine reply");
    }
}

struct Shared {
    inner: Mutex<Inner>,
    latest_seq: AtomicU64,
    supervisor: Arc<RetrySupervisor>,
    options: ProtocolOptions,
    events: broadcast::Sender<BridgeEvent>,
}

/// Entry point for commands
#[derive(Clone)]
pub struct CommandDispatcher {
    shared: Arc<Shared>,
}

impl CommandDispatcher {
    pub fn new(
        supervisor: Arc<RetrySupervisor>,
        options: ProtocolOptions,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    machine: ConnectionStateMachine::new(),
                    pending: None,
                    retired: VecDeque::new(),
                    last_seq: RequestSeq::default(),
                    last_request: None,
                    last_node: None,
                }),
                latest_seq: AtomicU64::new(0),
                supervisor,
                options,
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `seq` the latest accepted command, for the engine's event tags too
    fn accept(&self, inner: &mut Inner, seq: RequestSeq) {
        inner.last_seq = seq;
        self.shared.latest_seq.store(seq.0, Ordering::SeqCst);
        self.shared.supervisor.client().note_seq(seq);
    }

    /// Submit a command
    ///
    /// Commands incompatible with the committed state fail here, before any
    /// engine call, and are announced to the UI as a notice.
    pub fn submit(&self, command: Command) -> Result<RequestHandle, SessionError> {
        let verb = command.verb();
        let mut inner = self.lock();
        let seq = inner.last_seq.next();

        // Reset is only valid from Failed, where nothing is ever pending
        let superseded = command != Command::Reset && inner.supersede(seq);
        let current = inner.machine.state().clone();

        let intent = match (command, current) {
            (Command::Reset, _) => {
                let state = inner
                    .machine
                    .apply(Trigger::ResetRequested, seq)
                    .map_err(|e| self.conflict(e, verb))?;
                self.accept(&mut inner, seq);
                info!(seq = %seq, "Failure acknowledged");
                return Ok(RequestHandle::ready(seq, Ok(state)));
            }
            (Command::Disconnect, ConnectionState::Disconnected) => {
                self.accept(&mut inner, seq);
                drop(inner);
                if superseded {
                    self.spawn_cleanup(seq);
                } else {
                    debug!(seq = %seq, "Already disconnected");
                }
                return Ok(RequestHandle::ready(seq, Ok(ConnectionState::Disconnected)));
            }
            (Command::Disconnect, _) => {
                inner
                    .machine
                    .apply(Trigger::DisconnectRequested, seq)
                    .map_err(|e| self.conflict(e, verb))?;
                Intent::Disconnect
            }
            (Command::Connect { node_id }, _) | (Command::Switch { node_id }, ConnectionState::Disconnected) => {
                inner
                    .machine
                    .apply(Trigger::ConnectRequested, seq)
                    .map_err(|e| self.conflict(e, verb))?;
                Intent::Connect(ConnectionRequest::new(node_id, self.shared.options.clone(), seq))
            }
            (Command::Switch { node_id }, ConnectionState::Connected) => {
                inner
                    .machine
                    .apply(Trigger::DisconnectRequested, seq)
                    .map_err(|e| self.conflict(e, verb))?;
                Intent::Switch(ConnectionRequest::new(node_id, self.shared.options.clone(), seq))
            }
            (Command::Switch { .. }, current) => {
                return Err(self.conflict(
                    SessionError::StateConflict {
                        current,
                        requested: verb.to_string(),
                    },
                    verb,
                ));
            }
        };

        self.accept(&mut inner, seq);
        let cancel = CancelToken::default();
        let (tx, rx) = oneshot::channel();
        inner.pending = Some(PendingCommand {
            info: PendingCommandInfo {
                seq,
                intent: intent.clone(),
                issued_at: Utc::now(),
                cancelled: false,
            },
            cancel: cancel.clone(),
            completion: Some(tx),
        });
        drop(inner);

        info!(seq = %seq, command = verb, "Command accepted");
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.execute(seq, intent, cancel, superseded).await });

        Ok(RequestHandle { seq, rx })
    }

    fn conflict(&self, err: SessionError, verb: &str) -> SessionError {
        let SessionError::StateConflict { current, .. } = err else {
            return err;
        };
        let err = SessionError::StateConflict {
            current: current.clone(),
            requested: verb.to_string(),
        };
        warn!(state = %current, command = verb, "Command rejected");
        let _ = self.shared.events.send(BridgeEvent::Notice {
            message: err.to_string(),
            state: current,
        });
        err
    }

    async fn execute(&self, seq: RequestSeq, intent: Intent, cancel: CancelToken, superseded: bool) {
        let supervisor = &self.shared.supervisor;
        if superseded {
            supervisor.best_effort_disconnect(seq).await;
        }

        match intent {
            Intent::Connect(request) | Intent::Reconnect(request) => self.run_connect(&request, &cancel).await,
            Intent::Disconnect => {
                if let Some(confirmed) = self.run_disconnect(seq, &cancel).await {
                    let error = confirmed.err().map(SessionError::Engine);
                    let trigger = if error.is_some() {
                        Trigger::Abort
                    } else {
                        Trigger::DisconnectConfirmed
                    };
                    self.resolve(seq, trigger, error);
                }
            }
            Intent::Switch(request) => {
                let Some(confirmed) = self.run_disconnect(seq, &cancel).await else {
                    return;
                };
                let trigger = if confirmed.is_ok() {
                    Trigger::DisconnectConfirmed
                } else {
                    Trigger::Abort
                };
                if self.begin_connect_phase(seq, trigger) {
                    self.run_connect(&request, &cancel).await;
                }
            }
        }
    }

    async fn run_connect(&self, request: &ConnectionRequest, cancel: &CancelToken) {
        let trigger = match self.shared.supervisor.connect(request, cancel).await {
            Outcome::Completed(handle) => Trigger::Established(handle),
            Outcome::Failed(e) => Trigger::EngineFailed(RetrySupervisor::connect_failure(&e)),
            Outcome::Cancelled => return,
        };
        self.resolve(request.seq(), trigger, None);
    }

    /// Supervised disconnect; `None` when cancelled
    ///
    /// An exhausted disconnect is reported but the bridge still treats the
    /// tunnel as gone.
    async fn run_disconnect(&self, seq: RequestSeq, cancel: &CancelToken) -> Option<Result<(), EngineError>> {
        match self.shared.supervisor.disconnect(seq, cancel).await {
            Outcome::Completed(()) => Some(Ok(())),
            Outcome::Failed(e) => {
                warn!(seq = %seq, error = %e, "Disconnect not confirmed, assuming disconnected");
                let _ = self.shared.events.send(BridgeEvent::EngineError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                Some(Err(e))
            }
            Outcome::Cancelled => None,
        }
    }

    fn begin_connect_phase(&self, seq: RequestSeq, disconnected: Trigger) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(seq) {
            inner.discard(seq, disconnected.name());
            return false;
        }
        inner.machine.apply(disconnected, seq).is_ok() && inner.machine.apply(Trigger::ConnectRequested, seq).is_ok()
    }

    /// Apply the final reply of command `seq` and complete its handle
    ///
    /// Replies for anything but the pending command are discarded. Returns
    /// whether the reply was applied.
    pub(crate) fn resolve(&self, seq: RequestSeq, trigger: Trigger, error: Option<SessionError>) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(seq) {
            inner.discard(seq, trigger.name());
            return false;
        }

        if let Trigger::Established(handle) = &trigger {
            inner.last_node = Some(handle.node_id.clone());
            let request = inner.pending.as_ref().and_then(|p| match &p.info.intent {
                Intent::Connect(r) | Intent::Switch(r) | Intent::Reconnect(r) => Some(r.clone()),
                Intent::Disconnect => None,
            });
            if request.is_some() {
                inner.last_request = request;
            }
        }

        let result = match (inner.machine.apply(trigger, seq), error) {
            (Ok(ConnectionState::Failed(reason)), _) => Err(SessionError::Failed(reason)),
            (Ok(_), Some(err)) => Err(err),
            (Ok(state), None) => Ok(state),
            (Err(e), _) => Err(e),
        };

        if let Some(tx) = inner.pending.take().and_then(|mut p| p.completion.take()) {
            let _ = tx.send(result);
        }
        true
    }

    /// Register an autonomous reconnect as the pending command
    ///
    /// Only when `Connected` with nothing pending and `observed` is not older
    /// than the latest accepted command.
    pub(crate) fn begin_recovery(&self, observed: RequestSeq) -> Option<RecoveryJob> {
        let mut inner = self.lock();
        if !inner.machine.state().is_connected() || inner.pending.is_some() || observed < inner.last_seq {
            return None;
        }

        let seq = inner.last_seq.next();
        let request = inner.last_request.as_ref()?.reissue(seq);
        inner.machine.apply(Trigger::LinkLost, seq).ok()?;
        self.accept(&mut inner, seq);

        let cancel = CancelToken::default();
        inner.pending = Some(PendingCommand {
            info: PendingCommandInfo {
                seq,
                intent: Intent::Reconnect(request.clone()),
                issued_at: Utc::now(),
                cancelled: false,
            },
            cancel: cancel.clone(),
            completion: None,
        });

        Some(RecoveryJob { seq, request, cancel })
    }

    /// Cancel whatever is pending and roll back to `Disconnected`
    pub fn cancel_pending(&self) -> bool {
        let mut inner = self.lock();
        let seq = inner.last_seq.next();
        if !inner.supersede(seq) {
            return false;
        }
        self.accept(&mut inner, seq);
        drop(inner);

        self.spawn_cleanup(seq);
        true
    }

    fn spawn_cleanup(&self, seq: RequestSeq) {
        let supervisor = Arc::clone(&self.shared.supervisor);
        tokio::spawn(async move { supervisor.best_effort_disconnect(seq).await });
    }

    /// Fail the pending command with `Closed` without touching the engine
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(mut pending) = inner.pending.take() {
            pending.cancel.cancel();
            if let Some(tx) = pending.completion.take() {
                let _ = tx.send(Err(SessionError::Closed));
            }
        }
    }

    /// Update the live session's counters
    pub fn record_statistics(&self, stats: &SessionStats) -> bool {
        self.lock().machine.record_statistics(stats)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().machine.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.lock().machine.subscribe()
    }

    /// Sequence number of the latest accepted command
    pub fn latest_seq(&self) -> RequestSeq {
        RequestSeq(self.shared.latest_seq.load(Ordering::SeqCst))
    }

    /// Sequence number of the autonomous reconnect in flight, if any
    pub fn recovering(&self) -> Option<RequestSeq> {
        self.lock().pending.as_ref().and_then(|p| match p.info.intent {
            Intent::Reconnect(_) => Some(p.info.seq),
            _ => None,
        })
    }

    pub fn pending(&self) -> Option<PendingCommandInfo> {
        self.lock().pending.as_ref().map(|p| p.info.clone())
    }

    /// Superseded commands, oldest first
    pub fn retired(&self) -> Vec<PendingCommandInfo> {
        self.lock().retired.iter().cloned().collect()
    }

    /// Node of the most recent successful connection
    pub fn last_node(&self) -> Option<String> {
        self.lock().last_node.clone()
    }

    pub fn remember_node(&self, node_id: String) {
        self.lock().last_node = Some(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::supervisor::RetryPolicy;
    use crate::engine::mock::{MockCall, MockEngine, MockReply};
    use crate::engine::{CallDeadlines, EngineClient};
    use std::time::Duration;

    fn dispatcher(engine: &MockEngine) -> CommandDispatcher {
        let client = EngineClient::new(Arc::new(engine.clone()), CallDeadlines::default());
        let supervisor = Arc::new(RetrySupervisor::new(RetryPolicy::default(), client));
        let (events, _) = broadcast::channel(16);
        CommandDispatcher::new(supervisor, ProtocolOptions::default(), events)
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let engine = MockEngine::new();
        let dispatcher = dispatcher(&engine);

        let handle = dispatcher
            .submit(Command::Connect {
                node_id: Some("0xnode".to_string()),
            })
            .unwrap();
        assert_eq!(handle.seq(), RequestSeq(1));
        assert_eq!(handle.wait().await, Ok(ConnectionState::Connected));
        assert_eq!(dispatcher.last_node(), Some("0xnode".to_string()));

        let handle = dispatcher.submit(Command::Disconnect).unwrap();
        assert_eq!(handle.wait().await, Ok(ConnectionState::Disconnected));
        assert!(dispatcher.pending().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_disconnected_skips_engine() {
        let engine = MockEngine::new();
        let dispatcher = dispatcher(&engine);

        let handle = dispatcher.submit(Command::Disconnect).unwrap();
        assert_eq!(handle.wait().await, Ok(ConnectionState::Disconnected));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commands_without_engine_call_still_tag_events() {
        let engine = MockEngine::new();
        let dispatcher = dispatcher(&engine);

        dispatcher.submit(Command::Disconnect).unwrap().wait().await.unwrap();
        assert_eq!(engine.noted_seq(), RequestSeq(1));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset_outside_failed_is_conflict() {
        let engine = MockEngine::new();
        let dispatcher = dispatcher(&engine);

        let err = dispatcher.submit(Command::Reset).unwrap_err();
        assert_eq!(
            err,
            SessionError::StateConflict {
                current: ConnectionState::Disconnected,
                requested: "reset".to_string(),
            }
        );
        assert_eq!(dispatcher.latest_seq(), RequestSeq(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_rolls_back() {
        let engine = MockEngine::new();
        engine.push_connect(MockReply::hang());
        let dispatcher = dispatcher(&engine);

        let handle = dispatcher.submit(Command::Connect { node_id: None }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(dispatcher.cancel_pending());
        assert_eq!(handle.wait().await, Err(SessionError::Superseded { seq: RequestSeq(1) }));
        assert_eq!(dispatcher.snapshot().state, ConnectionState::Disconnected);
        assert_eq!(dispatcher.retired().len(), 1);
        assert!(dispatcher.retired()[0].cancelled);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.calls().contains(&MockCall::Disconnect { seq: RequestSeq(2) }));
    }

    #[tokio::test]
    async fn test_stale_resolution_is_discarded() {
        let engine = MockEngine::new();
        let dispatcher = dispatcher(&engine);

        assert!(!dispatcher.resolve(RequestSeq(9), Trigger::DisconnectConfirmed, None));
        assert_eq!(dispatcher.snapshot().state, ConnectionState::Disconnected);
    }
}
