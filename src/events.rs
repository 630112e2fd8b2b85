// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events
//!
//! A small typed pub/sub over the connection lifecycle. Listeners may be
//! many; ordering among listeners for the same event is unspecified. Events
//! are best-effort: a lagging subscriber drops old events rather than
//! blocking the core.

use crate::errors::ClientError;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Events emitted by the connection core.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The initial connection reached the broker.
    Connected,
    /// The broker connection was lost.
    Disconnected {
        reason: Option<String>,
    },
    /// A reconnection attempt has been scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        delay: Duration,
    },
    /// A reconnection attempt succeeded and channel setup re-ran.
    Reconnected,
    /// A terminal failure or exhausted reconnect budget.
    Error(ClientError),
}

impl ClientEvent {
    /// Short tag used in logs and test assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Connected => "connected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::Reconnecting { .. } => "reconnecting",
            ClientEvent::Reconnected => "reconnected",
            ClientEvent::Error(_) => "error",
        }
    }
}

/// Broadcast bus for [`ClientEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emits to all current subscribers; silently drops when there are none.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_subscribers_see_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ClientEvent::Connected);
        bus.emit(ClientEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(250),
        });

        assert_eq!(a.recv().await.unwrap().kind(), "connected");
        assert_eq!(b.recv().await.unwrap().kind(), "connected");
        match a.recv().await.unwrap() {
            ClientEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(250));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(ClientEvent::Reconnected);
    }
}
