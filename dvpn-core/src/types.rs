//! Type definitions shared by the bridge components
//!
//! Value objects exchanged between the UI entry point, the dispatcher,
//! the state machine and the engine control client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sequence number assigned by the dispatcher to every accepted command
///
/// Strictly increasing for the lifetime of a bridge session. Replies and
/// events carrying an older number than the latest accepted command are stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestSeq(pub u64);

impl RequestSeq {
    /// The sequence number following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RequestSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunnel service offered by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Wireguard,
    Openvpn,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Wireguard => "wireguard",
            ServiceType::Openvpn => "openvpn",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Ok(ServiceType::Wireguard),
            "openvpn" => Ok(ServiceType::Openvpn),
            other => Err(format!("unknown service type: {}", other)),
        }
    }
}

/// Protocol options requested alongside a connect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolOptions {
    pub service_type: ServiceType,
}

/// A single connect request as handed to the engine
///
/// Created by the dispatcher, immutable afterwards. The supervisor reissues
/// the last-known request under a fresh sequence number when it reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    node_id: Option<String>,
    options: ProtocolOptions,
    seq: RequestSeq,
}

impl ConnectionRequest {
    pub(crate) fn new(node_id: Option<String>, options: ProtocolOptions, seq: RequestSeq) -> Self {
        // An empty identifier and no identifier both mean "any node"
        let node_id = node_id.filter(|id| !id.trim().is_empty());
        Self {
            node_id,
            options,
            seq,
        }
    }

    /// Request built outside the dispatcher, for driving a transport directly
    #[cfg(any(test, feature = "mock-engine"))]
    pub fn new_for_test(node_id: Option<&str>, seq: RequestSeq) -> Self {
        Self::new(node_id.map(str::to_string), ProtocolOptions::default(), seq)
    }

    /// Same target and options under a new sequence number
    pub(crate) fn reissue(&self, seq: RequestSeq) -> Self {
        Self {
            node_id: self.node_id.clone(),
            options: self.options.clone(),
            seq,
        }
    }

    /// Requested node, `None` meaning any
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    pub fn seq(&self) -> RequestSeq {
        self.seq
    }
}

/// Why the state machine came to rest in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Connect attempts exhausted without an engine reply
    EngineUnreachable,
    /// Engine explicitly refused the connect
    EngineRejected { code: String },
    /// Link lost and the autonomous reconnect did not succeed
    ConnectionLost,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::EngineUnreachable => write!(f, "engine unreachable"),
            FailureReason::EngineRejected { code } => write!(f, "engine rejected ({})", code),
            FailureReason::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// What the VPN is doing right now
///
/// Exactly one live value per bridge session, owned by the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    Failed(FailureReason),
}

impl ConnectionState {
    /// `Disconnected` and `Failed` are resting states: nothing is in flight
    pub fn is_resting(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Engine's reply to a successful connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Opaque, engine-assigned
    pub session_id: String,
    pub node_id: String,
}

/// Cumulative traffic counters reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_ms: u64,
}

/// One `Connected` lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub session_id: String,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_ms: u64,
}

impl ConnectionSession {
    /// Start a session with zeroed counters
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            session_id: handle.session_id,
            node_id: handle.node_id,
            started_at: Utc::now(),
            bytes_up: 0,
            bytes_down: 0,
            duration_ms: 0,
        }
    }

    /// Replace counters with the latest cumulative values
    pub fn record(&mut self, stats: &SessionStats) {
        self.bytes_up = stats.bytes_up;
        self.bytes_down = stats.bytes_down;
        self.duration_ms = stats.duration_ms;
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            duration_ms: self.duration_ms,
        }
    }
}

/// Observable value published to the UI after every committed change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub session: Option<ConnectionSession>,
    /// Sequence number of the command that produced the last transition
    pub seq: RequestSeq,
}

/// Commands accepted by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { node_id: Option<String> },
    Disconnect,
    /// Move a live connection to another node
    Switch { node_id: Option<String> },
    /// Acknowledge a failure and return to `Disconnected`
    Reset,
}

impl Command {
    /// Verb used in conflict notices
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect => "disconnect",
            Command::Switch { .. } => "switch node",
            Command::Reset => "reset",
        }
    }
}

/// Action requested by the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiAction {
    Connect,
    Disconnect,
}

/// Command submission payload from the UI: `{action, nodeId?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiCommand {
    pub action: UiAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl From<UiCommand> for Command {
    fn from(cmd: UiCommand) -> Self {
        match cmd.action {
            UiAction::Connect => Command::Connect {
                node_id: cmd.node_id,
            },
            UiAction::Disconnect => Command::Disconnect,
        }
    }
}

/// Node offering a service, as listed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProposal {
    pub provider_id: String,
    pub service_type: ServiceType,
    pub country_code: Option<String>,
}

impl NodeProposal {
    /// Stable identifier combining provider and service
    pub fn id(&self) -> String {
        format!("{}-{}", self.provider_id, self.service_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_node_means_any() {
        let req = ConnectionRequest::new(Some("  ".to_string()), ProtocolOptions::default(), RequestSeq(1));
        assert_eq!(req.node_id(), None);

        let req = ConnectionRequest::new(Some("0xnode".to_string()), ProtocolOptions::default(), RequestSeq(2));
        assert_eq!(req.node_id(), Some("0xnode"));
    }

    #[test]
    fn test_reissue_keeps_target_with_new_seq() {
        let req = ConnectionRequest::new(Some("0xnode".to_string()), ProtocolOptions::default(), RequestSeq(3));
        let again = req.reissue(RequestSeq(7));
        assert_eq!(again.node_id(), Some("0xnode"));
        assert_eq!(again.seq(), RequestSeq(7));
    }

    #[test]
    fn test_ui_command_deserializes_camel_case() {
        let cmd: UiCommand = serde_json::from_str(r#"{"action":"connect","nodeId":"0xabc"}"#).unwrap();
        assert_eq!(
            Command::from(cmd),
            Command::Connect {
                node_id: Some("0xabc".to_string())
            }
        );

        let cmd: UiCommand = serde_json::from_str(r#"{"action":"disconnect"}"#).unwrap();
        assert_eq!(Command::from(cmd), Command::Disconnect);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            ConnectionState::Failed(FailureReason::EngineRejected {
                code: "no_node_available".to_string()
            })
            .to_string(),
            "failed: engine rejected (no_node_available)"
        );
    }

    #[test]
    fn test_service_type_parse() {
        assert_eq!("WireGuard".parse::<ServiceType>(), Ok(ServiceType::Wireguard));
        assert_eq!("openvpn".parse::<ServiceType>(), Ok(ServiceType::Openvpn));
        assert!("ipsec".parse::<ServiceType>().is_err());
    }
}
