mod common;

use common::{events_until, fast_policy, memory_core, next_event};
use courier::connection::{ChannelSetup, ConnectionCore, ConnectionOptions, ConnectionState, ReconnectPolicy};
use courier::errors::ClientError;
use courier::events::ClientEvent;
use courier::transport::BrokerConnection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn connect_emits_connected_and_reaches_connected_state() {
    let (_broker, transport, core) = memory_core(fast_policy());
    let mut events = core.subscribe();

    let conn = core.get_connection().await.unwrap();
    assert!(conn.is_open());
    assert_eq!(core.state(), ConnectionState::Connected);
    assert_eq!(core.attempts(), 0);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(next_event(&mut events).await.kind(), "connected");
}

#[tokio::test]
async fn concurrent_callers_share_a_single_connection() {
    let (_broker, transport, core) = memory_core(fast_policy());
    transport.set_connect_delay(Some(Duration::from_millis(50)));

    let a = {
        let core = core.clone();
        tokio::spawn(async move { core.get_connection().await })
    };
    let b = {
        let core = core.clone();
        tokio::spawn(async move { core.get_connection().await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn get_connection_returns_immediately_when_connected() {
    let (_broker, transport, core) = memory_core(fast_policy());
    core.get_connection().await.unwrap();
    core.get_connection().await.unwrap();
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn terminal_connect_failure_propagates_and_is_emitted() {
    let (_broker, transport, core) = memory_core(fast_policy());
    transport.fail_next_connect(ClientError::AuthError("ACCESS_REFUSED".to_owned()));
    let mut events = core.subscribe();

    let err = core.get_connection().await.unwrap_err();
    assert_eq!(err, ClientError::AuthError("ACCESS_REFUSED".to_owned()));
    assert_eq!(core.state(), ConnectionState::Disconnected);

    match next_event(&mut events).await {
        ClientEvent::Error(event_err) => assert_eq!(event_err, err),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn recoverable_failure_with_reconnect_disabled_propagates() {
    let (_broker, transport, core) = memory_core(ReconnectPolicy::disabled());
    transport.fail_next_connect(ClientError::ConnectionError {
        message: "connection refused".to_owned(),
        code: None,
    });

    let err = core.get_connection().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionError { .. }));
    assert_eq!(core.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn connect_timeout_rejects_quickly_and_closes_the_late_connection() {
    let policy = ReconnectPolicy::disabled().with_connect_timeout(100);
    let (_broker, transport, core) = memory_core(policy);
    transport.set_connect_delay(Some(Duration::from_millis(500)));

    let started = Instant::now();
    let err = core.get_connection().await.unwrap_err();
    assert_eq!(err, ClientError::ConnectionTimeout);
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(transport.locally_closed_count(), 0);

    // The transport resolves at ~500ms; the reaper must close that socket.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.locally_closed_count(), 1);
    assert_eq!(transport.open_connection_count(), 0);
}

#[tokio::test]
async fn initial_recoverable_failure_resolves_through_the_reconnect_loop() {
    let (_broker, transport, core) = memory_core(fast_policy());
    transport.fail_next_connect(ClientError::ConnectionError {
        message: "connection refused".to_owned(),
        code: None,
    });
    let mut events = core.subscribe();

    let conn = core.get_connection().await.unwrap();
    assert!(conn.is_open());
    assert_eq!(core.state(), ConnectionState::Connected);
    assert_eq!(core.attempts(), 0);

    let seen = events_until(&mut events, "reconnected").await;
    assert!(seen.iter().any(|e| e.kind() == "reconnecting"));
}

#[tokio::test]
async fn connection_loss_triggers_reconnect_and_restores_channel_setup() {
    let (broker, _transport, core) = memory_core(fast_policy());
    let mut events = core.subscribe();

    let setups = Arc::new(AtomicUsize::new(0));
    let setup_counter = setups.clone();
    let setup: ChannelSetup = Arc::new(move |_channel| {
        let setups = setup_counter.clone();
        Box::pin(async move {
            setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    let handle = core.create_channel(Some(setup)).await.unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(next_event(&mut events).await.kind(), "connected");

    broker.drop_connections();

    let seen = events_until(&mut events, "reconnected").await;
    assert_eq!(seen.first().map(ClientEvent::kind), Some("disconnected"));
    assert!(seen.iter().any(|e| e.kind() == "reconnecting"));

    assert_eq!(core.state(), ConnectionState::Connected);
    assert_eq!(core.attempts(), 0);
    assert_eq!(setups.load(Ordering::SeqCst), 2);
    assert!(handle.channel().is_some(), "channel reference was swapped in");
}

#[tokio::test]
async fn reconnecting_attempts_are_numbered_and_bounded_by_max_attempts() {
    let policy = fast_policy().with_max_attempts(2);
    let (_broker, transport, core) = memory_core(policy);
    for _ in 0..3 {
        transport.fail_next_connect(ClientError::ConnectionError {
            message: "connection refused".to_owned(),
            code: None,
        });
    }
    let mut events = core.subscribe();

    let err = core.get_connection().await.unwrap_err();
    assert_eq!(err, ClientError::MaxReconnectAttempts(2));
    assert_eq!(core.state(), ConnectionState::Disconnected);

    let seen = events_until(&mut events, "error").await;
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn max_attempts_zero_gives_up_without_a_reconnecting_event() {
    let policy = fast_policy().with_max_attempts(0);
    let (_broker, transport, core) = memory_core(policy);
    transport.fail_next_connect(ClientError::ConnectionError {
        message: "connection refused".to_owned(),
        code: None,
    });
    let mut events = core.subscribe();

    let err = core.get_connection().await.unwrap_err();
    assert_eq!(err, ClientError::MaxReconnectAttempts(0));

    let seen = events_until(&mut events, "error").await;
    assert!(seen.iter().all(|e| e.kind() != "reconnecting"));
}

#[tokio::test]
async fn close_cancels_the_reconnect_loop() {
    let (_broker, transport, core) = memory_core(fast_policy());
    for _ in 0..200 {
        transport.fail_next_connect(ClientError::ConnectionError {
            message: "connection refused".to_owned(),
            code: None,
        });
    }
    let waiter = {
        let core = core.clone();
        tokio::spawn(async move { core.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    core.close().await;
    assert!(waiter.await.unwrap().is_err());
    assert_eq!(core.state(), ConnectionState::Disconnected);

    let attempts_after_close = transport.connect_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.connect_count(), attempts_after_close);
}

#[tokio::test]
async fn get_connection_after_close_fails() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    core.get_connection().await.unwrap();
    core.close().await;
    assert!(core.get_connection().await.is_err());
}

#[tokio::test]
async fn unregistered_channels_are_not_resurrected() {
    let (broker, _transport, core) = memory_core(fast_policy());
    let setups = Arc::new(AtomicUsize::new(0));
    let setup_counter = setups.clone();
    let setup: ChannelSetup = Arc::new(move |_channel| {
        let setups = setup_counter.clone();
        Box::pin(async move {
            setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    let handle = core.create_channel(Some(setup)).await.unwrap();
    core.unregister_channel(&handle);

    let mut events = core.subscribe();
    broker.drop_connections();
    events_until(&mut events, "reconnected").await;

    assert_eq!(setups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn registry_hands_out_one_core_per_uri() {
    let broker = courier::testing::MemoryBroker::new();
    let uri_a = "amqp://registry-test-a";
    let uri_b = "amqp://registry-test-b";

    let a1 = ConnectionCore::get_with_transport(
        uri_a,
        ConnectionOptions::default(),
        broker.transport(),
    );
    let a2 = ConnectionCore::get_with_transport(
        uri_a,
        ConnectionOptions::default(),
        broker.transport(),
    );
    let b = ConnectionCore::get_with_transport(
        uri_b,
        ConnectionOptions::default(),
        broker.transport(),
    );
    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));

    ConnectionCore::reset(uri_a).await;
    assert!(a1.is_closing());
    let a3 = ConnectionCore::get_with_transport(
        uri_a,
        ConnectionOptions::default(),
        broker.transport(),
    );
    assert!(!Arc::ptr_eq(&a1, &a3));

    ConnectionCore::reset(uri_a).await;
    ConnectionCore::reset(uri_b).await;
}
