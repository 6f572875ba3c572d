//! Bridge session
//!
//! Wires the engine client, state machine, dispatcher, event relay and
//! supervisor together for the lifetime of one UI session.

use crate::bridge::dispatcher::{CommandDispatcher, CommandResult, PendingCommandInfo, RequestHandle};
use crate::bridge::relay::{BridgeEvent, EventRelay};
use crate::bridge::supervisor::RetrySupervisor;
use crate::config::toml_config::TomlConfig;
use crate::engine::{CallDeadlines, EngineClient, EngineTransport};
use crate::error::{DvpnError, SessionError};
use crate::store::{PreferenceStore, LAST_NODE_KEY};
use crate::types::{Command, ProtocolOptions, StateSnapshot, UiCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered UI events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

/// A running bridge between a UI and the engine
pub struct BridgeSession {
    dispatcher: CommandDispatcher,
    client: EngineClient,
    events: broadcast::Sender<BridgeEvent>,
    store: Arc<dyn PreferenceStore>,
    connection_ip: watch::Receiver<Option<String>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeSession {
    /// Validate `config` and start the relay and supervisor tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &TomlConfig,
        transport: Arc<dyn EngineTransport>,
        store: Arc<dyn PreferenceStore>,
    ) -> Result<Self, DvpnError> {
        config.validate()?;

        let policy = config.retry_policy();
        let relay_config = config.relay_config();
        let client = EngineClient::new(transport, CallDeadlines::from(&config.engine));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let supervisor = Arc::new(RetrySupervisor::new(policy.clone(), client.clone()));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&supervisor),
            ProtocolOptions {
                service_type: config.engine.service_type,
            },
            events.clone(),
        );

        match store.get(LAST_NODE_KEY) {
            Ok(Some(node_id)) => {
                debug!(node = %node_id, "Restored last node");
                dispatcher.remember_node(node_id);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read preferences: {}", e),
        }

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ip_tx, connection_ip) = watch::channel(None);

        let relay = EventRelay::new(
            client.clone(),
            dispatcher.clone(),
            fault_tx,
            events.clone(),
            Duration::from_millis(relay_config.statistics_window_ms),
            policy,
            ip_tx,
        );

        let tasks = vec![
            tokio::spawn(relay.run(shutdown_rx.clone())),
            tokio::spawn(supervisor.run(dispatcher.clone(), fault_rx, events.clone(), shutdown_rx)),
        ];

        info!(engine = %config.engine.address, "Bridge session started");

        Ok(Self {
            dispatcher,
            client,
            events,
            store,
            connection_ip,
            shutdown,
            tasks,
        })
    }

    /// Submit a command; see [`CommandDispatcher::submit`]
    pub fn submit(&self, command: Command) -> Result<RequestHandle, SessionError> {
        self.dispatcher.submit(command)
    }

    /// Submit a `{action, nodeId?}` payload from the UI
    pub fn submit_ui(&self, command: UiCommand) -> Result<RequestHandle, SessionError> {
        self.submit(command.into())
    }

    /// Submit and wait for the command to resolve
    pub async fn execute(&self, command: Command) -> CommandResult {
        self.submit(command)?.wait().await
    }

    /// Watch every committed state change
    pub fn state(&self) -> watch::Receiver<StateSnapshot> {
        self.dispatcher.subscribe()
    }

    /// Last committed state and session, never the engine's own view
    pub fn status(&self) -> StateSnapshot {
        self.dispatcher.snapshot()
    }

    /// Subscribe to relayed engine events and notices
    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Public IP last reported by the engine
    ///
    /// Refreshed whenever the engine settles in connected or not connected.
    pub fn connection_ip(&self) -> Option<String> {
        self.connection_ip.borrow().clone()
    }

    pub fn pending(&self) -> Option<PendingCommandInfo> {
        self.dispatcher.pending()
    }

    pub fn cancel_pending(&self) -> bool {
        self.dispatcher.cancel_pending()
    }

    pub fn last_node(&self) -> Option<String> {
        self.dispatcher.last_node()
    }

    /// Engine client for queries outside the command flow
    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    /// Stop background tasks and persist preferences
    ///
    /// The tunnel is left as is; disconnect first to tear it down.
    pub async fn shutdown(self) -> Result<(), DvpnError> {
        self.dispatcher.close();
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }

        if let Some(node_id) = self.dispatcher.last_node() {
            self.store.set(LAST_NODE_KEY, &node_id)?;
        }

        info!("Bridge session stopped");
        Ok(())
    }
}
