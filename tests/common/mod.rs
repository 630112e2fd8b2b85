#![allow(dead_code)]

use courier::connection::{ConnectionCore, ConnectionOptions, ReconnectPolicy};
use courier::events::ClientEvent;
use courier::testing::{MemoryBroker, MemoryTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Reconnect policy tuned for tests: tiny jittered delays, quick timeouts.
pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_initial_delay(10)
        .with_max_delay(20)
        .with_connect_timeout(1_000)
}

/// A fresh in-memory broker with an unregistered connection core over it.
pub fn memory_core(
    policy: ReconnectPolicy,
) -> (MemoryBroker, Arc<MemoryTransport>, Arc<ConnectionCore>) {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let core = ConnectionCore::new(
        "amqp://mem-test",
        ConnectionOptions::default().with_reconnect(policy),
        transport.clone(),
    );
    (broker, transport, core)
}

pub async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event bus closed")
}

/// Receives events until one matches `kind`, returning everything seen on
/// the way (the match included).
pub async fn events_until(
    rx: &mut broadcast::Receiver<ClientEvent>,
    kind: &str,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.kind() == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
}
