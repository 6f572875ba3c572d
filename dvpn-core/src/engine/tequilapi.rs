//! Tequilapi HTTP transport
//!
//! Talks to the engine's local REST control API. The API has no push
//! channel, so the event subscription is a background poller that turns
//! status changes into [`EngineEvent`]s.

use super::{EngineEvent, EngineHealth, EngineStatus, EngineTransport, EventSink, EventSubscription};
use crate::config::EngineConfig;
use crate::error::{EngineError, CODE_IDENTITY_REQUIRED, CODE_NOT_CONNECTED, CODE_NO_NODE_AVAILABLE};
use crate::types::{ConnectionRequest, NodeProposal, RequestSeq, ServiceType, SessionHandle, SessionStats};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionCreateDto<'a> {
    consumer_id: &'a str,
    provider_id: &'a str,
    service_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatusDto {
    status: EngineStatus,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsDto {
    bytes_sent: u64,
    bytes_received: u64,
    /// Seconds
    duration: u64,
}

#[derive(Debug, Deserialize)]
struct ProposalsDto {
    #[serde(default)]
    proposals: Vec<ProposalDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposalDto {
    provider_id: String,
    service_type: String,
    #[serde(default)]
    service_definition: Option<ServiceDefinitionDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDefinitionDto {
    #[serde(default)]
    location_originate: Option<LocationDto>,
}

#[derive(Debug, Deserialize)]
struct LocationDto {
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthcheckDto {
    uptime: String,
    #[serde(default)]
    version: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionIpDto {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ErrorDto {
    message: String,
}

impl From<StatisticsDto> for SessionStats {
    fn from(dto: StatisticsDto) -> Self {
        SessionStats {
            bytes_up: dto.bytes_sent,
            bytes_down: dto.bytes_received,
            duration_ms: dto.duration.saturating_mul(1000),
        }
    }
}

impl ProposalDto {
    fn into_proposal(self) -> Option<NodeProposal> {
        let service_type = self.service_type.parse().ok()?;
        let country_code = self
            .service_definition
            .and_then(|def| def.location_originate)
            .and_then(|loc| loc.country);
        Some(NodeProposal {
            provider_id: self.provider_id,
            service_type,
            country_code,
        })
    }
}

/// Thin HTTP layer shared by the transport and its poller
#[derive(Clone)]
struct Api {
    client: Client,
    base: Url,
}

impl Api {
    fn url(&self, path: &str) -> Result<Url, EngineError> {
        self.base.join(path).map_err(|e| EngineError::Unreachable {
            reason: format!("Invalid engine URL for {}: {}", path, e),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<&impl Serialize>) -> Result<reqwest::Response, EngineError> {
        let is_delete = method == Method::DELETE;
        let mut request = self.client.request(method, self.url(path)?);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| EngineError::Unreachable {
            reason: format!("Engine request {} failed: {}", path, e),
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let message = match response.json::<ErrorDto>().await {
            Ok(dto) => dto.message,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        let code = match status {
            StatusCode::CONFLICT if is_delete => CODE_NOT_CONNECTED.to_string(),
            other => format!("http_{}", other.as_u16()),
        };
        Err(EngineError::Rejected { code, message })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let response = self.send(Method::GET, path, None::<&()>).await?;
        Self::decode(path, response).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T, EngineError> {
        response.json::<T>().await.map_err(|e| {
            EngineError::rejected("invalid_reply", format!("Malformed reply to {}: {}", path, e))
        })
    }

    async fn connection_status(&self) -> Result<ConnectionStatusDto, EngineError> {
        self.get("connection").await
    }

    async fn statistics(&self) -> Result<StatisticsDto, EngineError> {
        self.get("connection/statistics").await
    }
}

/// Engine transport speaking Tequilapi over HTTP
pub struct TequilapiTransport {
    api: Api,
    identity: Option<String>,
    poll_interval: Duration,
    /// Sequence number of the latest mutating call, echoed in polled events
    last_seq: Arc<AtomicU64>,
}

impl TequilapiTransport {
    /// Create a transport for the configured engine address
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut base = Url::parse(&config.address).map_err(|e| EngineError::Unreachable {
            reason: format!("Invalid engine address {}: {}", config.address, e),
        })?;
        // Url::join replaces the last segment unless the path ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| EngineError::Unreachable {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            api: Api { client, base },
            identity: config.identity.clone().filter(|id| !id.is_empty()),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            last_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Resolve "any node" to the first proposal for the service
    async fn pick_node(&self, service_type: ServiceType) -> Result<String, EngineError> {
        let proposals = self.proposals(service_type).await?;
        proposals
            .into_iter()
            .next()
            .map(|p| p.provider_id)
            .ok_or_else(|| {
                EngineError::rejected(
                    CODE_NO_NODE_AVAILABLE,
                    format!("No node offers {}", service_type),
                )
            })
    }
}

#[async_trait]
impl EngineTransport for TequilapiTransport {
    async fn connect(&self, request: &ConnectionRequest) -> Result<SessionHandle, EngineError> {
        self.note_seq(request.seq());

        let consumer_id = self.identity.as_deref().ok_or_else(|| {
            EngineError::rejected(CODE_IDENTITY_REQUIRED, "Consumer identity is not configured")
        })?;

        let service_type = request.options().service_type;
        let provider_id = match request.node_id() {
            Some(node) => node.to_string(),
            None => self.pick_node(service_type).await?,
        };

        let body = ConnectionCreateDto {
            consumer_id,
            provider_id: &provider_id,
            service_type: service_type.as_str(),
        };
        let response = self.api.send(Method::PUT, "connection", Some(&body)).await?;
        let dto: ConnectionStatusDto = Api::decode("connection", response).await?;

        match dto.session_id.filter(|id| !id.is_empty()) {
            Some(session_id) => Ok(SessionHandle {
                session_id,
                node_id: provider_id,
            }),
            None => Err(EngineError::rejected(
                "invalid_reply",
                format!("Connect reply without session id (status {:?})", dto.status),
            )),
        }
    }

    async fn disconnect(&self, seq: RequestSeq) -> Result<(), EngineError> {
        self.note_seq(seq);
        self.api.send(Method::DELETE, "connection", None::<&()>).await?;
        Ok(())
    }

    async fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.api.connection_status().await?.status)
    }

    async fn subscribe(&self) -> Result<EventSubscription, EngineError> {
        // Fail fast when the engine is down so the caller can back off
        let initial = self.api.connection_status().await?.status;
        let (sink, subscription) = EventSubscription::channel();

        let poller = StatusPoller {
            api: self.api.clone(),
            last_seq: Arc::clone(&self.last_seq),
            interval: self.poll_interval,
            last_status: initial,
        };
        tokio::spawn(poller.run(sink));

        Ok(subscription)
    }

    async fn proposals(&self, service_type: ServiceType) -> Result<Vec<NodeProposal>, EngineError> {
        let path = format!("proposals?serviceType={}", service_type.as_str());
        let dto: ProposalsDto = self.api.get(&path).await?;
        Ok(dto
            .proposals
            .into_iter()
            .filter_map(ProposalDto::into_proposal)
            .filter(|p| p.service_type == service_type)
            .collect())
    }

    async fn healthcheck(&self) -> Result<EngineHealth, EngineError> {
        let dto: HealthcheckDto = self.api.get("healthcheck").await?;
        let version = match dto.version {
            serde_json::Value::String(v) => v,
            serde_json::Value::Object(map) => map
                .get("commit")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        Ok(EngineHealth {
            uptime: dto.uptime,
            version,
        })
    }

    async fn connection_ip(&self) -> Result<String, EngineError> {
        let dto: ConnectionIpDto = self.api.get("connection/ip").await?;
        Ok(dto.ip)
    }

    fn note_seq(&self, seq: RequestSeq) {
        self.last_seq.fetch_max(seq.0, Ordering::SeqCst);
    }
}

/// Background task feeding one subscription
struct StatusPoller {
    api: Api,
    last_seq: Arc<AtomicU64>,
    interval: Duration,
    last_status: EngineStatus,
}

impl StatusPoller {
    async fn run(mut self, sink: EventSink) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if sink.is_closed() {
                debug!("Event subscriber dropped, stopping status poller");
                break;
            }
            if !self.poll(&sink).await {
                break;
            }
        }
    }

    /// One polling round; returns false once the subscriber is gone
    async fn poll(&mut self, sink: &EventSink) -> bool {
        let seq = RequestSeq(self.last_seq.load(Ordering::SeqCst));

        let status = match self.api.connection_status().await {
            Ok(dto) => dto.status,
            Err(e) => {
                let fatal = self.last_status == EngineStatus::Connected;
                warn!(error = %e, fatal, "Status poll failed");
                // Report the loss once; later failures are not fatal
                self.last_status = EngineStatus::NotConnected;
                return sink
                    .send(EngineEvent::EngineError {
                        code: e.code().to_string(),
                        message: e.to_string(),
                        fatal,
                    })
                    .is_ok();
            }
        };

        if status != self.last_status {
            trace!(from = ?self.last_status, to = ?status, seq = %seq, "Engine status changed");
            let event = EngineEvent::StateChanged {
                from: self.last_status,
                to: status,
                seq,
            };
            self.last_status = status;
            if sink.send(event).is_err() {
                return false;
            }
        }

        if status == EngineStatus::Connected {
            match self.api.statistics().await {
                Ok(stats) => {
                    if sink.send(EngineEvent::Statistics(stats.into())).is_err() {
                        return false;
                    }
                }
                Err(e) => debug!(error = %e, "Statistics poll failed"),
            }
        }

        true
    }
}
