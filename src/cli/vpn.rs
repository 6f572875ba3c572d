//! Engine commands
//!
//! `connect` runs a bridge session in the foreground and relays its events
//! to the terminal. The other commands are one-shot engine queries.

use colored::Colorize;
use dvpn_core::bridge::{BridgeEvent, BridgeSession, CancelToken, Outcome, RetrySupervisor};
use dvpn_core::config::toml_config::{get_preferences_path, load_config_or_default, TomlConfig};
use dvpn_core::engine::{CallDeadlines, EngineClient, TequilapiTransport};
use dvpn_core::error::{DvpnError, SessionError};
use dvpn_core::format::{bytes_display, time_display};
use dvpn_core::store::FilePreferenceStore;
use dvpn_core::types::{Command, ConnectionState, FailureReason, RequestSeq, ServiceType, StateSnapshot};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Sequence tag for one-shot engine calls made outside any bridge session
const STANDALONE_SEQ: RequestSeq = RequestSeq(1);

fn engine_client(config: &TomlConfig) -> Result<EngineClient, DvpnError> {
    let transport = TequilapiTransport::new(&config.engine)?;
    Ok(EngineClient::new(Arc::new(transport), CallDeadlines::from(&config.engine)))
}

fn colored_state(state: &ConnectionState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        ConnectionState::Connected => text.green().bold(),
        ConnectionState::Disconnected => text.normal(),
        ConnectionState::Failed(_) => text.red().bold(),
        _ => text.yellow(),
    }
}

fn print_snapshot(snapshot: &StateSnapshot, ip: Option<&str>) {
    println!("State:    {}", colored_state(&snapshot.state));
    if let Some(ip) = ip {
        println!("IP:       {}", ip);
    }
    if let Some(session) = &snapshot.session {
        println!("Node:     {}", session.node_id);
        println!("Session:  {}", session.session_id);
        println!(
            "Since:    {}",
            session.started_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Statistics(stats) => println!(
            "{} ↑ {}  ↓ {}  {}",
            "stats".dimmed(),
            bytes_display(stats.bytes_up),
            bytes_display(stats.bytes_down),
            time_display(stats.duration_ms / 1000)
        ),
        BridgeEvent::EngineStateChanged { from, to, .. } => {
            println!("{} {:?} → {:?}", "engine".dimmed(), from, to)
        }
        BridgeEvent::EngineError { code, message } => {
            println!("{} {} ({})", "warning".yellow(), message, code)
        }
        BridgeEvent::Recovery { code, message, state } => {
            println!("{} {} ({}), now {}", "error".red(), message, code, colored_state(state))
        }
        BridgeEvent::Notice { message, .. } => println!("{} {}", "notice".cyan(), message),
    }
}

/// Wait for Ctrl+C while relaying events; `Some` when the session failed
async fn follow(session: &BridgeSession) -> Option<FailureReason> {
    let mut events = session.events();
    let mut state = session.state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return None,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event display fell behind"),
                Err(RecvError::Closed) => return None,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return None;
                }
                let snapshot = state.borrow_and_update().clone();
                println!("{} {}", "state".dimmed(), colored_state(&snapshot.state));
                if let ConnectionState::Failed(reason) = snapshot.state {
                    return Some(reason);
                }
            }
        }
    }
}

/// Run the connect command
pub async fn run_connect(node: Option<String>, last: bool, service: Option<ServiceType>) -> Result<(), DvpnError> {
    let mut config = load_config_or_default()?;
    if let Some(service) = service {
        config.engine.service_type = service;
    }

    let transport = Arc::new(TequilapiTransport::new(&config.engine)?);
    let store = Arc::new(FilePreferenceStore::new(get_preferences_path()?));
    let session = BridgeSession::start(&config, transport, store)?;

    let node = if last { session.last_node() } else { node };
    println!("Connecting to {}...", node.as_deref().unwrap_or("any node"));

    let connected = session.execute(Command::Connect { node_id: node }).await;
    if let Err(e) = connected {
        session.shutdown().await?;
        return Err(e.into());
    }
    let ip = match session.client().connection_ip().await {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!(error = %e, "Could not look up connection IP");
            session.connection_ip()
        }
    };
    print_snapshot(&session.status(), ip.as_deref());
    println!();
    println!("Press Ctrl+C to disconnect");

    let failure = follow(&session).await;

    let result = match failure {
        Some(reason) => Err(SessionError::Failed(reason)),
        None => {
            println!("Disconnecting...");
            session.execute(Command::Disconnect).await.map(|_| ())
        }
    };

    session.shutdown().await?;
    result?;
    println!("Disconnected");
    Ok(())
}

/// Run the disconnect command
pub async fn run_disconnect() -> Result<(), DvpnError> {
    let config = load_config_or_default()?;
    let supervisor = RetrySupervisor::new(config.retry_policy(), engine_client(&config)?);

    match supervisor.disconnect(STANDALONE_SEQ, &CancelToken::default()).await {
        Outcome::Failed(e) => Err(e.into()),
        Outcome::Completed(()) | Outcome::Cancelled => {
            info!("Engine tunnel torn down");
            println!("Disconnected");
            Ok(())
        }
    }
}

/// Run the status command
pub async fn run_status(json: bool) -> Result<(), DvpnError> {
    let config = load_config_or_default()?;
    let client = engine_client(&config)?;

    let health = client.healthcheck().await?;
    let status = client.status().await?;
    // Best effort: older engines lack the endpoint
    let ip = client.connection_ip().await.ok();

    if json {
        let report = serde_json::json!({
            "engine": config.engine.address,
            "health": health,
            "status": status,
            "ip": ip,
        });
        println!("{}", report);
        return Ok(());
    }

    println!("Engine:   {} ({})", config.engine.address, "reachable".green());
    println!("Version:  {}", health.version);
    println!("Uptime:   {}", health.uptime);
    println!("Status:   {:?}", status);
    if let Some(ip) = ip {
        println!("IP:       {}", ip);
    }
    Ok(())
}

/// Run the nodes command
pub async fn run_nodes(service: Option<ServiceType>, country: Option<String>) -> Result<(), DvpnError> {
    let config = load_config_or_default()?;
    let service = service.unwrap_or(config.engine.service_type);

    let nodes: Vec<_> = engine_client(&config)?
        .proposals(service)
        .await?
        .into_iter()
        .filter(|node| match (&country, &node.country_code) {
            (Some(wanted), Some(code)) => wanted.eq_ignore_ascii_case(code),
            (Some(_), None) => false,
            (None, _) => true,
        })
        .collect();

    if nodes.is_empty() {
        println!("No nodes offer {}", service);
        return Ok(());
    }

    println!("{}", format!("{:<46} {:<10} {}", "NODE", "SERVICE", "COUNTRY").bold());
    for node in nodes {
        println!(
            "{:<46} {:<10} {}",
            node.provider_id,
            node.service_type.as_str(),
            node.country_code.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
