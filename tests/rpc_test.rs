mod common;

use common::{events_until, fast_policy, memory_core, next_event};
use courier::connection::{ConnectionCore, ConnectionOptions};
use courier::consumer::{Consumer, ConsumerOptions, ListenOptions, RetryPolicy};
use courier::errors::ClientError;
use courier::handler::{handler_fn, RouteOptions};
use courier::producer::{Producer, ProducerOptions, SendOptions};
use courier::shutdown::ShutdownOrchestrator;
use courier::testing::MemoryBroker;
use courier::topology::HEADER_RETRY_COUNT;
use courier::transport::{HeaderValue, MessageProperties};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const APP: &str = "rpc-app";

#[tokio::test]
async fn echo_rpc_round_trips_between_consumer_and_producer() {
    let (_broker, _transport, core) = memory_core(fast_policy());

    let consumer = Consumer::new(core.clone(), ConsumerOptions::new(APP));
    consumer.on(
        "echo",
        handler_fn(|_ctx, reply| async move {
            reply.send(&serde_json::json!({"pong": true})).await
        }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();

    let producer = Producer::new(core, ProducerOptions::new(APP));
    producer.connect().await.unwrap();

    let started = Instant::now();
    let reply: serde_json::Value = producer
        .send(
            "echo",
            &serde_json::json!({"x": 1}),
            SendOptions::default().with_timeout(Duration::from_millis(1_000)),
        )
        .await
        .unwrap();
    assert_eq!(reply, serde_json::json!({"pong": true}));
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

#[tokio::test]
async fn flaky_handlers_retry_before_replying() {
    let (broker, _transport, core) = memory_core(fast_policy());

    let consumer = Consumer::new(
        core.clone(),
        ConsumerOptions::new(APP).with_retry(
            RetryPolicy::default()
                .with_max_retries(3)
                .with_ttl(Duration::from_millis(50)),
        ),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    consumer.on(
        "flaky",
        handler_fn(move |ctx, reply| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let count = ctx
                    .headers
                    .get(HEADER_RETRY_COUNT)
                    .and_then(HeaderValue::as_i64)
                    .unwrap_or(0);
                if count < 2 {
                    Err(ClientError::handler("still flaky"))
                } else {
                    reply.send(&serde_json::json!({"done": count})).await
                }
            }
        }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();

    let producer = Producer::new(core, ProducerOptions::new(APP));
    producer.connect().await.unwrap();

    let started = Instant::now();
    let reply: serde_json::Value = producer
        .send(
            "flaky",
            &serde_json::json!({}),
            SendOptions::default().with_timeout(Duration::from_millis(2_000)),
        )
        .await
        .unwrap();
    assert_eq!(reply, serde_json::json!({"done": 2}));
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "both retries should sit out the 50ms TTL: {:?}",
        started.elapsed()
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.ack_count("flaky"), 1);
    assert_eq!(broker.ack_count(APP), 2);
}

#[tokio::test]
async fn reconnect_restores_topology_and_keeps_delivering() {
    let (broker, _transport, core) = memory_core(fast_policy());

    let consumer = Consumer::new(core.clone(), ConsumerOptions::new(APP));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    consumer.on(
        "order.created",
        handler_fn(move |_ctx, _reply| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();

    let mut events = core.subscribe();
    broker.drop_connections();

    let seen_events = events_until(&mut events, "reconnected").await;
    assert_eq!(seen_events.first().map(|e| e.kind()), Some("disconnected"));
    assert!(seen_events.iter().any(|e| e.kind() == "reconnecting"));
    assert!(broker.has_consumer(APP));

    broker.publish(APP, "order.created", b"{}", MessageProperties::json());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn orchestrator_shuts_everything_down_in_order() {
    let broker = MemoryBroker::new();
    let core = ConnectionCore::get_with_transport(
        "amqp://orchestrated",
        ConnectionOptions::default().with_reconnect(fast_policy()),
        broker.transport(),
    );

    let consumer = Arc::new(Consumer::new(core.clone(), ConsumerOptions::new(APP)));
    consumer.on(
        "noop",
        handler_fn(|_ctx, _reply| async { Ok(()) }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();

    let producer = Arc::new(Producer::new(core.clone(), ProducerOptions::new(APP)));
    producer.connect().await.unwrap();

    let callback_ran = Arc::new(AtomicBool::new(false));
    let flag = callback_ran.clone();
    let orchestrator = ShutdownOrchestrator::new()
        .with_consumer(consumer.clone())
        .with_producer(producer.clone())
        .with_timeout(Duration::from_millis(1_000))
        .with_callback(move || {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), ClientError>(())
            })
        });

    let summary = orchestrator.run().await.unwrap();
    assert!(callback_ran.load(Ordering::SeqCst));
    assert_eq!(summary.total_pending, 0);
    let consumer_result = summary.consumer.unwrap();
    assert!(consumer_result.success);
    assert!(!broker.has_consumer(APP));
    assert!(core.is_closing());
    assert!(core.get_connection().await.is_err());
}

#[tokio::test]
async fn orchestrator_propagates_callback_errors_after_draining() {
    let (broker, _transport, core) = memory_core(fast_policy());

    let consumer = Arc::new(Consumer::new(core.clone(), ConsumerOptions::new(APP)));
    consumer.on(
        "noop",
        handler_fn(|_ctx, _reply| async { Ok(()) }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();

    let orchestrator = ShutdownOrchestrator::new()
        .with_consumer(consumer.clone())
        .with_callback(|| {
            Box::pin(async { Err::<(), ClientError>(ClientError::handler("cleanup failed")) })
        });

    let err = orchestrator.run().await.unwrap_err();
    assert_eq!(err, ClientError::handler("cleanup failed"));
    // The consumer was still stopped before the callback blew up.
    assert!(!broker.has_consumer(APP));
}

#[tokio::test]
async fn connected_event_precedes_rpc_traffic() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    let mut events = core.subscribe();

    let consumer = Consumer::new(core.clone(), ConsumerOptions::new(APP));
    consumer.on(
        "echo",
        handler_fn(|ctx, reply| async move { reply.send(&ctx.content).await }),
        RouteOptions::default(),
    );
    consumer.listen(ListenOptions::default()).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "connected");

    let producer = Producer::new(core, ProducerOptions::new(APP));
    producer.connect().await.unwrap();

    let reply: serde_json::Value = producer
        .send(
            "echo",
            &serde_json::json!({"roundtrip": true}),
            SendOptions::default().with_timeout(Duration::from_millis(1_000)),
        )
        .await
        .unwrap();
    assert_eq!(reply, serde_json::json!({"roundtrip": true}));
}
