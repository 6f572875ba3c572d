//! Engine control client
//!
//! Typed wrapper over the native engine's local control API. The engine
//! itself is an external process; [`EngineTransport`] is the seam it plugs
//! into and [`EngineClient`] adds per-call deadlines on top.

#[cfg(any(test, feature = "mock-engine"))]
pub mod mock;
pub mod tequilapi;

use crate::config::EngineConfig;
use crate::error::{EngineError, CODE_NOT_CONNECTED};
use crate::types::{ConnectionRequest, NodeProposal, RequestSeq, ServiceType, SessionHandle, SessionStats};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use tequilapi::TequilapiTransport;

/// Connection status as the engine reports it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl EngineStatus {
    /// Whether a move from `self` to `next` means the link went away
    pub fn is_link_loss(self, next: EngineStatus) -> bool {
        self == EngineStatus::Connected
            && matches!(next, EngineStatus::NotConnected | EngineStatus::Reconnecting)
    }
}

/// Engine liveness information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub uptime: String,
    pub version: String,
}

/// Events pushed by the engine's subscription feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged {
        from: EngineStatus,
        to: EngineStatus,
        /// Sequence number of the command the engine was acting on
        seq: RequestSeq,
    },
    Statistics(SessionStats),
    EngineError {
        code: String,
        message: String,
        fatal: bool,
    },
}

/// Sending half handed to whatever produces engine events
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// Lazy, unbounded stream of engine events
///
/// Never ends while the engine is alive. When it does end, subscribe again.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventSubscription {
    /// Create a connected sink/subscription pair
    pub fn channel() -> (EventSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next event, `None` once the producer is gone
    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }
}

/// The engine's local control API
///
/// Implementations talk to the engine process; they do not enforce
/// deadlines or retries, which belong to [`EngineClient`] and the supervisor.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Ask the engine to establish a tunnel
    async fn connect(&self, request: &ConnectionRequest) -> Result<SessionHandle, EngineError>;

    /// Ask the engine to tear the tunnel down
    async fn disconnect(&self, seq: RequestSeq) -> Result<(), EngineError>;

    /// Current engine-side connection status
    async fn status(&self) -> Result<EngineStatus, EngineError>;

    /// Open a fresh event subscription
    async fn subscribe(&self) -> Result<EventSubscription, EngineError>;

    /// Nodes currently offering the given service
    async fn proposals(&self, service_type: ServiceType) -> Result<Vec<NodeProposal>, EngineError>;

    /// Engine liveness probe
    async fn healthcheck(&self) -> Result<EngineHealth, EngineError>;

    /// Public IP address the engine's traffic currently leaves from
    async fn connection_ip(&self) -> Result<String, EngineError>;

    /// Record the latest accepted command so pushed events carry its number
    ///
    /// Called for every command, including those that never reach the engine.
    fn note_seq(&self, _seq: RequestSeq) {}
}

/// Fixed deadline per call type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDeadlines {
    pub connect: Duration,
    pub disconnect: Duration,
    pub status: Duration,
}

impl Default for CallDeadlines {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            disconnect: Duration::from_secs(5),
            status: Duration::from_secs(3),
        }
    }
}

impl From<&EngineConfig> for CallDeadlines {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_timeout_ms),
            disconnect: Duration::from_millis(config.disconnect_timeout_ms),
            status: Duration::from_millis(config.status_timeout_ms),
        }
    }
}

/// Typed engine control client with per-call deadlines
#[derive(Clone)]
pub struct EngineClient {
    transport: Arc<dyn EngineTransport>,
    deadlines: CallDeadlines,
}

impl EngineClient {
    pub fn new(transport: Arc<dyn EngineTransport>, deadlines: CallDeadlines) -> Self {
        Self {
            transport,
            deadlines,
        }
    }

    pub fn deadlines(&self) -> CallDeadlines {
        self.deadlines
    }

    /// Run an engine call, turning an elapsed deadline into `EngineError::Timeout`
    async fn with_deadline<T, F>(operation: &str, deadline: Duration, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, deadline_ms = deadline.as_millis() as u64, "Engine call timed out");
                Err(EngineError::Timeout {
                    operation: operation.to_string(),
                    after_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Request a tunnel for `request`
    #[tracing::instrument(skip(self, request), fields(seq = %request.seq(), node = request.node_id().unwrap_or("any")))]
    pub async fn connect(&self, request: &ConnectionRequest) -> Result<SessionHandle, EngineError> {
        let handle = Self::with_deadline("connect", self.deadlines.connect, self.transport.connect(request)).await?;
        debug!(session = %handle.session_id, node = %handle.node_id, "Engine confirmed connect");
        Ok(handle)
    }

    /// Request teardown
    ///
    /// Disconnecting while the engine holds no tunnel is a success: the
    /// desired end state already holds.
    #[tracing::instrument(skip(self), fields(seq = %seq))]
    pub async fn disconnect(&self, seq: RequestSeq) -> Result<(), EngineError> {
        match Self::with_deadline("disconnect", self.deadlines.disconnect, self.transport.disconnect(seq)).await {
            Err(EngineError::Rejected { code, .. }) if code == CODE_NOT_CONNECTED => {
                debug!("Engine already disconnected");
                Ok(())
            }
            other => other,
        }
    }

    /// Engine-side status
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        Self::with_deadline("status", self.deadlines.status, self.transport.status()).await
    }

    /// Subscribe to the engine event feed
    pub async fn events(&self) -> Result<EventSubscription, EngineError> {
        Self::with_deadline("subscribe", self.deadlines.status, self.transport.subscribe()).await
    }

    pub async fn proposals(&self, service_type: ServiceType) -> Result<Vec<NodeProposal>, EngineError> {
        Self::with_deadline("proposals", self.deadlines.status, self.transport.proposals(service_type)).await
    }

    pub async fn healthcheck(&self) -> Result<EngineHealth, EngineError> {
        Self::with_deadline("healthcheck", self.deadlines.status, self.transport.healthcheck()).await
    }

    pub async fn connection_ip(&self) -> Result<String, EngineError> {
        Self::with_deadline("connection ip", self.deadlines.status, self.transport.connection_ip()).await
    }

    /// Tag subsequent engine events with `seq`
    pub fn note_seq(&self, seq: RequestSeq) {
        self.transport.note_seq(seq);
    }
}
