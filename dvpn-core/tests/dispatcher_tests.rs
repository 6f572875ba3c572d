//! Integration tests for command dispatch
//!
//! Exercises the command flow UI → dispatcher → supervisor → engine against
//! the scripted mock engine, under paused time so retry and deadline
//! arithmetic is exact.

mod common;

use dvpn_core::bridge::{BridgeEvent, Intent};
use dvpn_core::engine::mock::{MockCall, MockEngine, MockReply};
use dvpn_core::error::{EngineError, SessionError, CODE_NO_NODE_AVAILABLE};
use dvpn_core::types::{Command, ConnectionState, FailureReason, RequestSeq, UiAction, UiCommand};
use std::time::Duration;
use tokio::time::Instant;

fn connect(node: &str) -> Command {
    Command::Connect {
        node_id: Some(node.to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect() {
    let engine = MockEngine::new();
    let session = common::start(&engine);

    let state = session.execute(connect("0xA")).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);

    let status = session.status();
    let live = status.session.expect("connected state carries a session");
    assert_eq!(live.node_id, "0xA");
    assert_eq!(live.bytes_up, 0);
    assert_eq!(status.seq, RequestSeq(1));

    let state = session.execute(Command::Disconnect).await.unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(session.status().session.is_none());
    assert_eq!(engine.disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_disconnected_makes_no_engine_call() {
    let engine = MockEngine::new();
    let session = common::start(&engine);

    let state = session.execute(Command::Disconnect).await.unwrap();

    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(engine.disconnect_calls(), 0);
    assert_eq!(engine.connect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_newer_connect_supersedes_pending_one() {
    let engine = MockEngine::new();
    // Node A answers late, well inside its deadline
    engine.push_connect(MockReply::delayed(Duration::from_secs(10), Ok(engine.next_handle("0xA"))));
    let session = common::start(&engine);
    let mut state = session.state();

    let first = session.submit(connect("0xA")).unwrap();
    common::settle().await;
    assert_eq!(session.status().state, ConnectionState::Connecting);

    let second = session.submit(connect("0xB")).unwrap();
    assert_eq!(first.seq(), RequestSeq(1));
    assert_eq!(second.seq(), RequestSeq(2));

    assert_eq!(first.wait().await, Err(SessionError::Superseded { seq: RequestSeq(1) }));
    assert_eq!(second.wait().await, Ok(ConnectionState::Connected));

    // Let node A's reply arrive; it must not touch the committed state
    tokio::time::sleep(Duration::from_secs(20)).await;

    let snapshot = common::wait_for(&mut state, |s| s.state.is_connected()).await;
    let live = snapshot.session.unwrap();
    assert_eq!(live.node_id, "0xB");
    assert_eq!(live.session_id, "mock-session-2");
    assert_eq!(snapshot.seq, RequestSeq(2));

    // Cleanup disconnect precedes the new connect
    let calls = engine.calls();
    let cleanup = calls
        .iter()
        .position(|c| *c == MockCall::Disconnect { seq: RequestSeq(2) })
        .expect("superseding issues a cleanup disconnect");
    let connect_b = calls
        .iter()
        .position(|c| matches!(c, MockCall::Connect { seq: RequestSeq(2), .. }))
        .unwrap();
    assert!(cleanup < connect_b);
}

#[tokio::test(start_paused = true)]
async fn test_three_timeouts_fail_as_unreachable() {
    let engine = MockEngine::new();
    for _ in 0..4 {
        engine.push_connect(MockReply::hang());
    }
    let session = common::start(&engine);
    let started = Instant::now();

    let result = session.execute(Command::Connect { node_id: None }).await;

    assert_eq!(result, Err(SessionError::Failed(FailureReason::EngineUnreachable)));
    assert_eq!(engine.connect_calls(), 3);
    // 3 × 15s deadline plus 500ms and 1000ms backoff
    assert_eq!(started.elapsed(), Duration::from_millis(46_500));
    assert_eq!(
        session.status().state,
        ConnectionState::Failed(FailureReason::EngineUnreachable)
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.connect_calls(), 3, "no fourth attempt");
}

#[tokio::test(start_paused = true)]
async fn test_rejection_fails_without_retry() {
    let engine = MockEngine::new();
    engine.push_connect(MockReply::immediate(Err(EngineError::rejected(
        CODE_NO_NODE_AVAILABLE,
        "no node offers wireguard",
    ))));
    let session = common::start(&engine);

    let result = session.execute(Command::Connect { node_id: None }).await;

    assert_eq!(
        result,
        Err(SessionError::Failed(FailureReason::EngineRejected {
            code: CODE_NO_NODE_AVAILABLE.to_string()
        }))
    );
    assert_eq!(engine.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_requires_reset_before_connecting() {
    let engine = MockEngine::new();
    engine.push_connect(MockReply::immediate(Err(EngineError::rejected("busy", "engine busy"))));
    let session = common::start(&engine);
    let mut events = session.events();

    let _ = session.execute(connect("0xA")).await;

    let err = session.submit(connect("0xA")).unwrap_err();
    assert!(matches!(
        err,
        SessionError::StateConflict {
            current: ConnectionState::Failed(_),
            ..
        }
    ));
    match events.recv().await.unwrap() {
        BridgeEvent::Notice { state, .. } => assert!(matches!(state, ConnectionState::Failed(_))),
        other => panic!("expected a notice, got {:?}", other),
    }

    assert_eq!(session.execute(Command::Reset).await, Ok(ConnectionState::Disconnected));
    assert_eq!(session.execute(connect("0xA")).await, Ok(ConnectionState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_command_is_rejected_before_engine() {
    let engine = MockEngine::new();
    let session = common::start(&engine);

    session.execute(connect("0xA")).await.unwrap();
    let err = session.submit(connect("0xB")).unwrap_err();

    assert_eq!(
        err,
        SessionError::StateConflict {
            current: ConnectionState::Connected,
            requested: "connect".to_string(),
        }
    );
    assert_eq!(engine.connect_calls(), 1);
    assert_eq!(session.status().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_switch_disconnects_then_connects() {
    let engine = MockEngine::new();
    let session = common::start(&engine);

    session.execute(connect("0xA")).await.unwrap();
    let state = session
        .execute(Command::Switch {
            node_id: Some("0xB".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(session.status().session.unwrap().node_id, "0xB");
    assert_eq!(
        engine.calls().into_iter().filter(|c| *c != MockCall::Subscribe).collect::<Vec<_>>(),
        vec![
            MockCall::Connect {
                seq: RequestSeq(1),
                node_id: Some("0xA".to_string())
            },
            MockCall::Disconnect { seq: RequestSeq(2) },
            MockCall::Connect {
                seq: RequestSeq(2),
                node_id: Some("0xB".to_string())
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_falls_back_to_disconnected() {
    let engine = MockEngine::new();
    let session = common::start(&engine);
    session.execute(connect("0xA")).await.unwrap();

    engine.set_unreachable(true);
    let result = session.execute(Command::Disconnect).await;

    assert!(matches!(result, Err(SessionError::Engine(EngineError::Unreachable { .. }))));
    assert_eq!(engine.disconnect_calls(), 3);
    assert_eq!(session.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_pending_command_is_observable() {
    let engine = MockEngine::new();
    engine.push_connect(MockReply::hang());
    let session = common::start(&engine);

    let handle = session.submit(connect("0xA")).unwrap();
    common::settle().await;

    let pending = session.pending().expect("connect is in flight");
    assert_eq!(pending.seq, handle.seq());
    assert!(!pending.cancelled);
    assert!(matches!(pending.intent, Intent::Connect(ref r) if r.node_id() == Some("0xA")));
    assert_eq!(session.status().state, ConnectionState::Connecting);
    assert!(session.status().session.is_none());

    assert!(session.cancel_pending());
    assert!(session.pending().is_none());
    assert_eq!(session.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_ui_payload_is_dispatched() {
    let engine = MockEngine::new();
    let session = common::start(&engine);

    let handle = session
        .submit_ui(UiCommand {
            action: UiAction::Connect,
            node_id: Some(String::new()),
        })
        .unwrap();
    assert_eq!(handle.wait().await, Ok(ConnectionState::Connected));

    // An empty node id means "any node"
    assert!(engine.calls().contains(&MockCall::Connect {
        seq: RequestSeq(1),
        node_id: None
    }));
}
