//! Retry and recovery supervision
//!
//! Every engine call made on behalf of a command goes through
//! [`RetrySupervisor`], which applies timeout-aware retry with exponential
//! backoff and decides which failure state a call resolves into. The
//! supervisor also owns link-loss recovery: it reacts to faults reported by
//! the event relay and drives an autonomous reconnect through the dispatcher.

use crate::bridge::dispatcher::{CancelToken, CommandDispatcher};
use crate::bridge::relay::BridgeEvent;
use crate::bridge::state::Trigger;
use crate::engine::EngineClient;
use crate::error::EngineError;
use crate::types::{ConnectionRequest, FailureReason, RequestSeq, SessionHandle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per engine call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Multiplier for exponential backoff (typically 2)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,

    /// Cap for exponential growth
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_max_delay() -> u64 {
    4_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Validate the entire policy
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(PolicyValidationError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(PolicyValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        if !(1..=60_000).contains(&self.base_delay_ms) {
            return Err(PolicyValidationError::InvalidBaseDelay(self.base_delay_ms));
        }
        if !(1..=10).contains(&self.backoff_multiplier) {
            return Err(PolicyValidationError::InvalidBackoffMultiplier(self.backoff_multiplier));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PolicyValidationError::MaxDelayLessThanBase(
                self.max_delay_ms,
                self.base_delay_ms,
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-indexed)
    ///
    /// Formula: base_delay × multiplier^(attempt-1), capped at max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = (self.backoff_multiplier as u64)
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Validation errors for RetryPolicy
#[derive(Debug, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("max_attempts must be between 1 and 10, got: {0}")]
    InvalidMaxAttempts(u32),

    #[error("base_delay_ms must be between 1 and 60000, got: {0}")]
    InvalidBaseDelay(u64),

    #[error("backoff_multiplier must be between 1 and 10, got: {0}")]
    InvalidBackoffMultiplier(u32),

    #[error("max_delay_ms ({0}) must be >= base_delay_ms ({1})")]
    MaxDelayLessThanBase(u64, u64),
}

/// Result of a supervised engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    /// Non-retryable failure, or the last error once attempts ran out
    Failed(EngineError),
    /// The owning command was superseded; no further attempts were made
    Cancelled,
}

/// Faults the event relay hands over for a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Engine reported the tunnel went away
    LinkLost { seq: RequestSeq },
    /// Fatal engine error
    EngineFatal {
        code: String,
        message: String,
        seq: RequestSeq,
        /// Reconnect that was already in flight when the error arrived
        interrupted: Option<RequestSeq>,
    },
}

/// Supervises engine calls and recovers from link loss
pub struct RetrySupervisor {
    policy: RetryPolicy,
    client: EngineClient,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy, client: EngineClient) -> Self {
        Self { policy, client }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    /// Run `call` with retry-and-backoff
    ///
    /// `EngineRejected` is never retried. Cancellation is checked before each
    /// attempt; an attempt already in flight is left to finish.
    pub async fn call<T, F, Fut>(&self, operation: &str, cancel: &CancelToken, mut call: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                debug!(operation, attempt, "Supervised call cancelled");
                return Outcome::Cancelled;
            }

            match call().await {
                Ok(value) => return Outcome::Completed(value),
                Err(e) if !e.is_retryable() => {
                    warn!(operation, error = %e, "Engine refused, not retrying");
                    return Outcome::Failed(e);
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    error!(operation, attempts = attempt, error = %e, "Retry budget exhausted");
                    return Outcome::Failed(e);
                }
                Err(e) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Engine call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Supervised connect
    pub async fn connect(&self, request: &ConnectionRequest, cancel: &CancelToken) -> Outcome<SessionHandle> {
        self.call("connect", cancel, || self.client.connect(request)).await
    }

    /// Supervised disconnect
    pub async fn disconnect(&self, seq: RequestSeq, cancel: &CancelToken) -> Outcome<()> {
        self.call("disconnect", cancel, || self.client.disconnect(seq)).await
    }

    /// Single-attempt cleanup issued when a command is superseded
    pub async fn best_effort_disconnect(&self, seq: RequestSeq) {
        if let Err(e) = self.client.disconnect(seq).await {
            warn!(seq = %seq, error = %e, "Cleanup disconnect failed");
        }
    }

    /// Failure state a failed connect resolves into
    pub fn connect_failure(error: &EngineError) -> FailureReason {
        match error {
            EngineError::Rejected { code, .. } => FailureReason::EngineRejected { code: code.clone() },
            EngineError::Unreachable { .. } | EngineError::Timeout { .. } => FailureReason::EngineUnreachable,
        }
    }

    /// Recover from a link loss: reconnect with the last-known request
    ///
    /// Returns without effect when the dispatcher is not in a recoverable
    /// state (not connected, a command pending, or a stale fault).
    #[tracing::instrument(skip(self, dispatcher), fields(observed = %observed))]
    pub async fn recover(&self, dispatcher: &CommandDispatcher, observed: RequestSeq) {
        let Some(job) = dispatcher.begin_recovery(observed) else {
            debug!("Nothing to recover");
            return;
        };

        info!(seq = %job.seq, node = job.request.node_id().unwrap_or("any"), "Link lost, reconnecting");
        let trigger = match self.connect(&job.request, &job.cancel).await {
            Outcome::Completed(handle) => Trigger::Established(handle),
            Outcome::Failed(e) => {
                warn!(error = %e, "Reconnect failed");
                Trigger::RetriesExhausted(FailureReason::ConnectionLost)
            }
            Outcome::Cancelled => return,
        };

        dispatcher.resolve(job.seq, trigger, None);
    }

    async fn handle(&self, dispatcher: &CommandDispatcher, events: &broadcast::Sender<BridgeEvent>, fault: Fault) {
        match fault {
            Fault::LinkLost { seq } => self.recover(dispatcher, seq).await,
            Fault::EngineFatal {
                code,
                message,
                seq,
                interrupted,
            } => {
                error!(code = %code, "Fatal engine error: {}", message);
                match interrupted {
                    // That reconnect has settled by now; its outcome stands
                    Some(recovery) => debug!(recovery = %recovery, "Fatal error hit a reconnect, not recovering again"),
                    None => self.recover(dispatcher, seq).await,
                }
                // UI hears about the error only with the settled state
                let state = dispatcher.snapshot().state;
                let _ = events.send(BridgeEvent::Recovery { code, message, state });
            }
        }
    }

    /// Fault-handling loop
    ///
    /// Runs until shutdown is signalled or every fault sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        dispatcher: CommandDispatcher,
        mut faults: mpsc::UnboundedReceiver<Fault>,
        events: broadcast::Sender<BridgeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let fault = tokio::select! {
                fault = faults.recv() => match fault {
                    Some(fault) => fault,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            // Shutdown interrupts a recovery in progress
            tokio::select! {
                _ = self.handle(&dispatcher, &events, fault) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Supervisor stopped");
    }
}
