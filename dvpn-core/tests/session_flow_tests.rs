//! Integration tests for event relay and recovery
//!
//! Tests the engine → UI event flow: stale-event suppression, statistics
//! coalescing, link-loss recovery and fatal errors.

mod common;

use common::state_changed;
use dvpn_core::bridge::BridgeEvent;
use dvpn_core::engine::mock::{MockEngine, MockReply};
use dvpn_core::engine::{EngineEvent, EngineStatus};
use dvpn_core::store::{MemoryPreferenceStore, PreferenceStore, LAST_NODE_KEY};
use dvpn_core::types::{Command, ConnectionState, FailureReason, RequestSeq, SessionStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

fn stats(bytes: u64) -> EngineEvent {
    EngineEvent::Statistics(SessionStats {
        bytes_up: bytes,
        bytes_down: bytes * 2,
        duration_ms: bytes * 10,
    })
}

async fn connected(engine: &MockEngine, node: &str) -> dvpn_core::bridge::BridgeSession {
    let session = common::start_subscribed(engine).await;
    session
        .execute(Command::Connect {
            node_id: Some(node.to_string()),
        })
        .await
        .unwrap();
    session
}

#[tokio::test(start_paused = true)]
async fn test_stale_state_changes_are_dropped() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    session.execute(Command::Disconnect).await.unwrap();
    let mut events = session.events();

    // Produced by the connect, arriving after the disconnect was accepted
    engine.emit(state_changed(EngineStatus::Connecting, EngineStatus::Connected, 1));
    engine.emit(state_changed(EngineStatus::Connected, EngineStatus::NotConnected, 2));
    common::settle().await;

    assert_eq!(
        events.try_recv().unwrap(),
        BridgeEvent::EngineStateChanged {
            from: EngineStatus::Connected,
            to: EngineStatus::NotConnected,
            seq: RequestSeq(2),
        }
    );
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(session.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_statistics_are_coalesced_per_window() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut events = session.events();
    let started = Instant::now();

    for bytes in 1..=5 {
        engine.emit(stats(bytes));
    }
    common::settle().await;

    // Counters are live even before the UI update goes out
    assert_eq!(session.status().session.unwrap().bytes_up, 5);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        BridgeEvent::Statistics(SessionStats {
            bytes_up: 5,
            bytes_down: 10,
            duration_ms: 50,
        })
    );
    assert_eq!(started.elapsed(), Duration::from_millis(500));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn test_pending_statistics_flush_before_state_change() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut events = session.events();

    engine.emit(stats(7));
    engine.emit(EngineEvent::EngineError {
        code: "dns".to_string(),
        message: "resolver timeout".to_string(),
        fatal: false,
    });
    common::settle().await;

    assert!(matches!(events.try_recv().unwrap(), BridgeEvent::Statistics(s) if s.bytes_up == 7));
    assert!(matches!(events.try_recv().unwrap(), BridgeEvent::EngineError { code, .. } if code == "dns"));
}

#[tokio::test(start_paused = true)]
async fn test_statistics_without_session_are_ignored() {
    let engine = MockEngine::new();
    let session = common::start_subscribed(&engine).await;
    let mut events = session.events();

    engine.emit(stats(3));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert!(session.status().session.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_with_new_session() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut state = session.state();
    let first = session.status().session.unwrap();

    engine.push_connect(MockReply::delayed(Duration::from_secs(1), Ok(engine.next_handle("0xA"))));
    engine.emit(state_changed(EngineStatus::Connected, EngineStatus::NotConnected, 1));

    let reconnecting = common::wait_for(&mut state, |s| s.state == ConnectionState::Reconnecting).await;
    assert!(reconnecting.session.is_none());
    assert_eq!(reconnecting.seq, RequestSeq(2));

    let snapshot = common::wait_for(&mut state, |s| s.state.is_connected()).await;
    let second = snapshot.session.unwrap();
    assert_eq!(second.node_id, "0xA");
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.bytes_up, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_ends_in_connection_lost() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut state = session.state();

    for _ in 0..3 {
        engine.push_connect(MockReply::hang());
    }
    engine.emit(state_changed(EngineStatus::Connected, EngineStatus::Reconnecting, 1));

    let snapshot = common::wait_for(&mut state, |s| s.state.is_resting()).await;
    assert_eq!(snapshot.state, ConnectionState::Failed(FailureReason::ConnectionLost));
    assert_eq!(engine.connect_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_reported_with_settled_state() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut events = session.events();

    engine.emit(EngineEvent::EngineError {
        code: "tunnel_down".to_string(),
        message: "interface vanished".to_string(),
        fatal: true,
    });

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        BridgeEvent::Recovery {
            code: "tunnel_down".to_string(),
            message: "interface vanished".to_string(),
            state: ConnectionState::Connected,
        }
    );
    assert_eq!(engine.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ended_stream_while_connected_is_link_loss() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut state = session.state();

    engine.close_subscriptions();

    let snapshot = common::wait_for(&mut state, |s| {
        s.state.is_connected() && s.session.as_ref().map(|x| x.session_id.as_str()) == Some("mock-session-2")
    })
    .await;
    assert_eq!(snapshot.seq, RequestSeq(2));

    // The relay comes back after its backoff
    common::subscribed(&engine).await;
    assert_eq!(engine.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_resubscribes_after_stream_ends() {
    let engine = MockEngine::new();
    let session = common::start_subscribed(&engine).await;

    engine.close_subscriptions();
    assert_eq!(engine.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(engine.subscriber_count(), 1);
    assert_eq!(session.status().state, ConnectionState::Disconnected);
    assert_eq!(engine.connect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_last_node_survives_sessions() {
    let engine = MockEngine::new();
    let store = Arc::new(MemoryPreferenceStore::new());

    let session = common::start_with_store(&engine, store.clone());
    session
        .execute(Command::Connect {
            node_id: Some("0xA".to_string()),
        })
        .await
        .unwrap();
    session.shutdown().await.unwrap();
    assert_eq!(store.get(LAST_NODE_KEY).unwrap(), Some("0xA".to_string()));

    let session = common::start_with_store(&engine, store);
    assert_eq!(session.last_node(), Some("0xA".to_string()));
    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_during_reconnect_does_not_reconnect_again() {
    let engine = MockEngine::new();
    let session = connected(&engine, "0xA").await;
    let mut state = session.state();
    let mut events = session.events();

    engine.push_connect(MockReply::delayed(Duration::from_secs(1), Ok(engine.next_handle("0xA"))));
    engine.emit(state_changed(EngineStatus::Connected, EngineStatus::NotConnected, 1));
    common::wait_for(&mut state, |s| s.state == ConnectionState::Reconnecting).await;

    engine.emit(EngineEvent::EngineError {
        code: "tunnel_down".to_string(),
        message: "interface vanished".to_string(),
        fatal: true,
    });

    let recovery = loop {
        if let event @ BridgeEvent::Recovery { .. } = events.recv().await.unwrap() {
            break event;
        }
    };
    assert_eq!(
        recovery,
        BridgeEvent::Recovery {
            code: "tunnel_down".to_string(),
            message: "interface vanished".to_string(),
            state: ConnectionState::Connected,
        }
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.connect_calls(), 2);
    assert_eq!(session.status().seq, RequestSeq(2));
    assert!(session.status().state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connection_ip_follows_settled_engine_states() {
    let engine = MockEngine::new();
    engine.set_connection_ip("198.51.100.1");
    let session = connected(&engine, "0xA").await;
    common::settle().await;
    assert_eq!(session.connection_ip(), Some("198.51.100.1".to_string()));

    session.execute(Command::Disconnect).await.unwrap();
    engine.set_connection_ip("198.51.100.2");
    engine.emit(state_changed(EngineStatus::Connected, EngineStatus::NotConnected, 2));
    common::settle().await;
    assert_eq!(session.connection_ip(), Some("198.51.100.2".to_string()));

    // Transitional states leave the last address alone
    engine.set_connection_ip("198.51.100.3");
    engine.emit(state_changed(EngineStatus::NotConnected, EngineStatus::Connecting, 2));
    common::settle().await;
    assert_eq!(session.connection_ip(), Some("198.51.100.2".to_string()));
}
