//! Event relay
//!
//! Consumes the engine's event feed and forwards it to the UI in arrival
//! order. State changes older than the latest accepted command are dropped,
//! statistics are coalesced into one update per window, link loss and fatal
//! errors are handed to the supervisor instead of being decided here.
//! The relay also keeps the connection's public IP current.

use crate::bridge::dispatcher::CommandDispatcher;
use crate::bridge::supervisor::{Fault, RetryPolicy};
use crate::engine::{EngineClient, EngineEvent, EngineStatus, EventSubscription};
use crate::types::{ConnectionState, RequestSeq, SessionStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Notification delivered to UI subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    EngineStateChanged {
        from: EngineStatus,
        to: EngineStatus,
        seq: RequestSeq,
    },
    Statistics(SessionStats),
    /// Non-fatal engine error
    EngineError { code: String, message: String },
    /// Fatal engine error, reported once recovery settled
    Recovery {
        code: String,
        message: String,
        state: ConnectionState,
    },
    /// A command was refused without reaching the engine
    Notice { message: String, state: ConnectionState },
}

/// Statistics waiting for the end of the coalescing window
#[derive(Default)]
struct Coalescer {
    pending: Option<SessionStats>,
    flush_at: Option<Instant>,
}

impl Coalescer {
    fn push(&mut self, stats: SessionStats, window: Duration) {
        // Counters are cumulative, so the latest sample wins
        self.pending = Some(stats);
        self.flush_at.get_or_insert_with(|| Instant::now() + window);
    }

    fn take(&mut self) -> Option<SessionStats> {
        self.flush_at = None;
        self.pending.take()
    }

    async fn due(&self) {
        match self.flush_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

/// Forwards engine events to UI subscribers
pub struct EventRelay {
    client: EngineClient,
    dispatcher: CommandDispatcher,
    faults: mpsc::UnboundedSender<Fault>,
    events: broadcast::Sender<BridgeEvent>,
    window: Duration,
    resubscribe: RetryPolicy,
    connection_ip: Arc<watch::Sender<Option<String>>>,
}

impl EventRelay {
    pub fn new(
        client: EngineClient,
        dispatcher: CommandDispatcher,
        faults: mpsc::UnboundedSender<Fault>,
        events: broadcast::Sender<BridgeEvent>,
        window: Duration,
        resubscribe: RetryPolicy,
        connection_ip: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            faults,
            events,
            window,
            resubscribe,
            connection_ip: Arc::new(connection_ip),
        }
    }

    /// Relay events until shutdown, resubscribing whenever the feed ends
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscription = tokio::select! {
                subscription = self.client.events() => subscription,
                _ = shutdown.changed() => break,
            };

            match subscription {
                Ok(subscription) => {
                    failures = 0;
                    info!("Subscribed to engine events");
                    self.refresh_ip();
                    if !self.pump(subscription, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(attempt = failures, error = %e, "Engine event subscription failed");
                }
            }

            let delay = self.resubscribe.backoff(failures.max(1));
            debug!(delay_ms = delay.as_millis() as u64, "Resubscribing to engine events");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("Event relay stopped");
    }

    /// Drain one subscription; `false` when shutdown was requested
    async fn pump(&self, mut subscription: EventSubscription, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut stats = Coalescer::default();

        loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(event) => self.handle(event, &mut stats),
                    None => {
                        self.flush(&mut stats);
                        warn!("Engine event stream ended");
                        if self.dispatcher.snapshot().state.is_connected() {
                            self.report(Fault::LinkLost { seq: self.dispatcher.latest_seq() });
                        }
                        return true;
                    }
                },
                _ = stats.due() => self.flush(&mut stats),
                _ = shutdown.changed() => {
                    self.flush(&mut stats);
                    return false;
                }
            }
        }
    }

    fn handle(&self, event: EngineEvent, stats: &mut Coalescer) {
        match event {
            EngineEvent::StateChanged { from, to, seq } => {
                let latest = self.dispatcher.latest_seq();
                if seq < latest {
                    debug!(seq = %seq, latest = %latest, ?to, "Dropping stale state change");
                    return;
                }
                self.flush(stats);
                if from.is_link_loss(to) {
                    self.report(Fault::LinkLost { seq });
                }
                if matches!(to, EngineStatus::Connected | EngineStatus::NotConnected) {
                    self.refresh_ip();
                }
                self.send(BridgeEvent::EngineStateChanged { from, to, seq });
            }
            EngineEvent::Statistics(sample) => {
                if self.dispatcher.record_statistics(&sample) {
                    stats.push(sample, self.window);
                }
            }
            EngineEvent::EngineError { code, message, fatal } => {
                self.flush(stats);
                if fatal {
                    self.report(Fault::EngineFatal {
                        code,
                        message,
                        seq: self.dispatcher.latest_seq(),
                        interrupted: self.dispatcher.recovering(),
                    });
                } else {
                    warn!(code = %code, "Engine error: {}", message);
                    self.send(BridgeEvent::EngineError { code, message });
                }
            }
        }
    }

    /// Look up the public IP in the background
    fn refresh_ip(&self) {
        let client = self.client.clone();
        let connection_ip = Arc::clone(&self.connection_ip);
        tokio::spawn(async move {
            match client.connection_ip().await {
                Ok(ip) => {
                    debug!(ip = %ip, "Connection IP refreshed");
                    connection_ip.send_replace(Some(ip));
                }
                Err(e) => debug!(error = %e, "Connection IP refresh failed"),
            }
        });
    }

    fn flush(&self, stats: &mut Coalescer) {
        if let Some(sample) = stats.take() {
            self.send(BridgeEvent::Statistics(sample));
        }
    }

    fn send(&self, event: BridgeEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn report(&self, fault: Fault) {
        if self.faults.send(fault).is_err() {
            warn!("Supervisor is gone, fault dropped");
        }
    }
}
