//! Mock engine implementation for testing
//!
//! Provides a scripted in-process engine that doesn't require a running
//! engine process. Replies are queued per call type; anything not scripted
//! succeeds immediately.

use super::{EngineEvent, EngineHealth, EngineStatus, EngineTransport, EventSink, EventSubscription};
use crate::error::EngineError;
use crate::types::{ConnectionRequest, NodeProposal, RequestSeq, ServiceType, SessionHandle};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Node identifier reported when a connect asks for "any"
pub const MOCK_ANY_NODE: &str = "0xmock-node";

/// A scripted reply, delivered after `delay`
#[derive(Debug, Clone)]
pub struct MockReply<T> {
    delay: Duration,
    result: Result<T, EngineError>,
}

impl<T> MockReply<T> {
    pub fn immediate(result: Result<T, EngineError>) -> Self {
        Self {
            delay: Duration::ZERO,
            result,
        }
    }

    pub fn delayed(delay: Duration, result: Result<T, EngineError>) -> Self {
        Self { delay, result }
    }
}

impl MockReply<SessionHandle> {
    /// A reply that never arrives within any sane deadline
    pub fn hang() -> Self {
        Self::delayed(
            Duration::from_secs(3600),
            Err(EngineError::Unreachable {
                reason: "hung".to_string(),
            }),
        )
    }
}

/// Recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect { seq: RequestSeq, node_id: Option<String> },
    Disconnect { seq: RequestSeq },
    Status,
    Subscribe,
}

#[derive(Default)]
struct MockState {
    connect_replies: VecDeque<MockReply<SessionHandle>>,
    disconnect_replies: VecDeque<MockReply<()>>,
    status: EngineStatus,
    calls: Vec<MockCall>,
    subscribers: Vec<EventSink>,
    sessions_issued: u64,
    proposals: Vec<NodeProposal>,
    unreachable: bool,
    connection_ip: Option<String>,
    noted_seq: RequestSeq,
}

/// Scripted engine shared between the test and the bridge under test
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mint a handle with a fresh session identifier
    pub fn next_handle(&self, node_id: &str) -> SessionHandle {
        let mut state = self.lock();
        state.sessions_issued += 1;
        SessionHandle {
            session_id: format!("mock-session-{}", state.sessions_issued),
            node_id: node_id.to_string(),
        }
    }

    pub fn push_connect(&self, reply: MockReply<SessionHandle>) {
        self.lock().connect_replies.push_back(reply);
    }

    pub fn push_disconnect(&self, reply: MockReply<()>) {
        self.lock().disconnect_replies.push_back(reply);
    }

    pub fn set_proposals(&self, proposals: Vec<NodeProposal>) {
        self.lock().proposals = proposals;
    }

    pub fn set_connection_ip(&self, ip: &str) {
        self.lock().connection_ip = Some(ip.to_string());
    }

    /// Latest sequence number the bridge announced
    pub fn noted_seq(&self) -> RequestSeq {
        self.lock().noted_seq
    }

    /// Make every call fail as if the control channel were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Push an event to every live subscriber
    pub fn emit(&self, event: EngineEvent) {
        let mut state = self.lock();
        if let EngineEvent::StateChanged { to, .. } = &event {
            state.status = *to;
        }
        state.subscribers.retain(|sink| sink.send(event.clone()).is_ok());
    }

    /// Drop every subscription, as an engine crash would
    pub fn close_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sink| !sink.is_closed());
        state.subscribers.len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Connect { .. }))
            .count()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Disconnect { .. }))
            .count()
    }

    fn unreachable_error() -> EngineError {
        EngineError::Unreachable {
            reason: "mock engine is down".to_string(),
        }
    }
}

#[async_trait]
impl EngineTransport for MockEngine {
    async fn connect(&self, request: &ConnectionRequest) -> Result<SessionHandle, EngineError> {
        let reply = {
            let mut state = self.lock();
            state.calls.push(MockCall::Connect {
                seq: request.seq(),
                node_id: request.node_id().map(str::to_string),
            });
            if state.unreachable {
                return Err(Self::unreachable_error());
            }
            state.connect_replies.pop_front()
        };

        let result = match reply {
            Some(reply) => {
                tokio::time::sleep(reply.delay).await;
                reply.result
            }
            None => Ok(self.next_handle(request.node_id().unwrap_or(MOCK_ANY_NODE))),
        };

        if result.is_ok() {
            self.lock().status = EngineStatus::Connected;
        }
        result
    }

    async fn disconnect(&self, seq: RequestSeq) -> Result<(), EngineError> {
        let reply = {
            let mut state = self.lock();
            state.calls.push(MockCall::Disconnect { seq });
            if state.unreachable {
                return Err(Self::unreachable_error());
            }
            state.disconnect_replies.pop_front()
        };

        let result = match reply {
            Some(reply) => {
                tokio::time::sleep(reply.delay).await;
                reply.result
            }
            None => Ok(()),
        };

        if result.is_ok() {
            self.lock().status = EngineStatus::NotConnected;
        }
        result
    }

    async fn status(&self) -> Result<EngineStatus, EngineError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Status);
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        Ok(state.status)
    }

    async fn subscribe(&self) -> Result<EventSubscription, EngineError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Subscribe);
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        let (sink, subscription) = EventSubscription::channel();
        state.subscribers.push(sink);
        Ok(subscription)
    }

    async fn proposals(&self, service_type: ServiceType) -> Result<Vec<NodeProposal>, EngineError> {
        Ok(self
            .lock()
            .proposals
            .iter()
            .filter(|p| p.service_type == service_type)
            .cloned()
            .collect())
    }

    async fn healthcheck(&self) -> Result<EngineHealth, EngineError> {
        if self.lock().unreachable {
            return Err(Self::unreachable_error());
        }
        Ok(EngineHealth {
            uptime: "1h0m0s".to_string(),
            version: "mock".to_string(),
        })
    }

    async fn connection_ip(&self) -> Result<String, EngineError> {
        let state = self.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        state
            .connection_ip
            .clone()
            .ok_or_else(|| EngineError::rejected("ip_unknown", "no connection IP scripted"))
    }

    fn note_seq(&self, seq: RequestSeq) {
        let mut state = self.lock();
        state.noted_seq = state.noted_seq.max(seq);
    }
}
