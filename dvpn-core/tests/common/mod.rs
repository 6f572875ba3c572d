//! Shared helpers for bridge integration tests

#![allow(dead_code)]

use dvpn_core::bridge::BridgeSession;
use dvpn_core::config::toml_config::TomlConfig;
use dvpn_core::engine::mock::MockEngine;
use dvpn_core::engine::{EngineEvent, EngineStatus};
use dvpn_core::store::{MemoryPreferenceStore, PreferenceStore};
use dvpn_core::types::{RequestSeq, StateSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Start a bridge over `engine` with default settings
pub fn start(engine: &MockEngine) -> BridgeSession {
    start_with_store(engine, Arc::new(MemoryPreferenceStore::new()))
}

pub fn start_with_store(engine: &MockEngine, store: Arc<dyn PreferenceStore>) -> BridgeSession {
    BridgeSession::start(&TomlConfig::default(), Arc::new(engine.clone()), store)
        .expect("default config should start")
}

/// Start a bridge and wait until its relay is listening
pub async fn start_subscribed(engine: &MockEngine) -> BridgeSession {
    let session = start(engine);
    subscribed(engine).await;
    session
}

pub async fn subscribed(engine: &MockEngine) {
    while engine.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Let spawned tasks run without crossing any retry or coalescing timer
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait until the published snapshot satisfies `predicate`
pub async fn wait_for(
    rx: &mut watch::Receiver<StateSnapshot>,
    predicate: impl Fn(&StateSnapshot) -> bool,
) -> StateSnapshot {
    loop {
        {
            let snapshot = rx.borrow_and_update();
            if predicate(&snapshot) {
                return snapshot.clone();
            }
        }
        rx.changed().await.expect("bridge dropped its state publisher");
    }
}

pub fn state_changed(from: EngineStatus, to: EngineStatus, seq: u64) -> EngineEvent {
    EngineEvent::StateChanged {
        from,
        to,
        seq: RequestSeq(seq),
    }
}
