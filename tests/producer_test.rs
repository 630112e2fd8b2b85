mod common;

use common::{fast_policy, memory_core};
use courier::errors::ClientError;
use courier::producer::{Producer, ProducerOptions, SendOptions};
use courier::shutdown::ShutdownOptions;
use courier::transport::{
    BrokerChannel, BrokerConnection, DeliveryHandler, MessageProperties, QueueOptions, Transport,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const EXCHANGE: &str = "rpc";

/// Installs a raw responder consuming `routing_key` on the producer's
/// exchange, echoing `reply_body` after `delay`.
async fn install_responder(
    transport: &Arc<courier::testing::MemoryTransport>,
    routing_key: &str,
    reply_body: &'static [u8],
    delay: Duration,
) -> Arc<Mutex<Vec<(serde_json::Value, Option<String>)>>> {
    let conn = transport
        .connect("amqp://mem-test", &Default::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    channel
        .assert_exchange(EXCHANGE, courier::exchange::ExchangeKind::Direct, true)
        .await
        .unwrap();
    let queue = format!("svc-{routing_key}");
    channel
        .assert_queue(&queue, QueueOptions::durable())
        .await
        .unwrap();
    channel
        .bind_queue(&queue, EXCHANGE, routing_key)
        .await
        .unwrap();

    let requests: Arc<Mutex<Vec<(serde_json::Value, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let captured = requests.clone();
    let reply_channel = channel.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let channel = reply_channel.clone();
        let captured = captured.clone();
        Box::pin(async move {
            let _ = channel.ack(delivery.delivery_tag).await;
            let body = serde_json::from_slice(&delivery.payload)
                .unwrap_or(serde_json::Value::Null);
            captured
                .lock()
                .unwrap()
                .push((body, delivery.properties.correlation_id.clone()));
            tokio::time::sleep(delay).await;
            if let (Some(reply_to), Some(correlation_id)) = (
                delivery.properties.reply_to.clone(),
                delivery.properties.correlation_id.clone(),
            ) {
                let properties = MessageProperties {
                    correlation_id: Some(correlation_id),
                    ..MessageProperties::json()
                };
                let _ = channel
                    .send_to_queue(&reply_to, reply_body, properties)
                    .await;
            }
        })
    });
    channel.consume(&queue, false, handler).await.unwrap();
    requests
}

#[tokio::test]
async fn rpc_round_trip_resolves_with_the_decoded_reply() {
    let (_broker, transport, core) = memory_core(fast_policy());
    install_responder(&transport, "echo", b"{\"pong\":true}", Duration::ZERO).await;

    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
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
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn send_before_connect_fails_fast() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    let err = producer
        .send::<serde_json::Value, _>("echo", &serde_json::json!({}), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::NotConnected);
}

#[tokio::test]
async fn requests_time_out_when_no_reply_arrives() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    producer.connect().await.unwrap();

    let started = Instant::now();
    let err = producer
        .send::<serde_json::Value, _>(
            "void",
            &serde_json::json!({}),
            SendOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::RequestTimeout);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn disabled_timeout_is_settled_only_by_shutdown() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    let producer = Arc::new(Producer::new(core, ProducerOptions::new(EXCHANGE)));
    producer.connect().await.unwrap();

    let sender = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .send::<serde_json::Value, _>(
                    "void",
                    &serde_json::json!({}),
                    SendOptions::default().without_timeout(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(producer.pending_requests(), 1);

    let result = producer.shutdown(ShutdownOptions::forced()).await;
    assert!(result.success);
    assert_eq!(result.pending_count, 1);
    assert!(!result.timed_out);

    let err = sender.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::ShutdownCancelled);
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn late_replies_after_timeout_are_dropped() {
    let (_broker, transport, core) = memory_core(fast_policy());
    install_responder(
        &transport,
        "slow",
        b"{\"pong\":true}",
        Duration::from_millis(150),
    )
    .await;

    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    producer.connect().await.unwrap();

    let err = producer
        .send::<serde_json::Value, _>(
            "slow",
            &serde_json::json!({}),
            SendOptions::default().with_timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::RequestTimeout);

    // The reply lands well after the timeout and must be swallowed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn rejected_publishes_fail_the_request_immediately() {
    let (broker, _transport, core) = memory_core(fast_policy());
    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    producer.connect().await.unwrap();

    broker.set_publish_accepted(false);
    let err = producer
        .send::<serde_json::Value, _>("echo", &serde_json::json!({}), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PublishError(_)));
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn malformed_replies_reject_the_waiter() {
    let (_broker, transport, core) = memory_core(fast_policy());
    install_responder(&transport, "garbled", b"not json", Duration::ZERO).await;

    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    producer.connect().await.unwrap();

    let err = producer
        .send::<serde_json::Value, _>(
            "garbled",
            &serde_json::json!({}),
            SendOptions::default().with_timeout(Duration::from_millis(1_000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ParsePayloadError(_)));
}

#[tokio::test]
async fn mirror_id_copies_the_correlation_id_into_the_body() {
    let (_broker, transport, core) = memory_core(fast_policy());
    let requests =
        install_responder(&transport, "compat", b"{\"ok\":true}", Duration::ZERO).await;

    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    producer.connect().await.unwrap();

    let _: serde_json::Value = producer
        .send(
            "compat",
            &serde_json::json!({"x": 1}),
            SendOptions::default()
                .with_timeout(Duration::from_millis(1_000))
                .with_mirror_id(),
        )
        .await
        .unwrap();

    let captured = requests.lock().unwrap();
    assert_eq!(captured.len(), 1);
    let (body, correlation_id) = &captured[0];
    assert_eq!(body["x"], 1);
    assert_eq!(
        body["id"].as_str(),
        correlation_id.as_deref(),
        "body id mirrors the message correlation id"
    );
}

#[tokio::test]
async fn connect_creates_a_server_named_reply_queue() {
    let (_broker, _transport, core) = memory_core(fast_policy());
    let producer = Producer::new(core, ProducerOptions::new(EXCHANGE));
    assert!(producer.reply_queue().is_none());

    producer.connect().await.unwrap();
    let reply_queue = producer.reply_queue().unwrap();
    assert!(reply_queue.starts_with("amq.gen-"), "{reply_queue}");
}

#[tokio::test]
async fn unforced_shutdown_waits_for_outstanding_replies() {
    let (_broker, transport, core) = memory_core(fast_policy());
    install_responder(
        &transport,
        "slowish",
        b"{\"pong\":true}",
        Duration::from_millis(150),
    )
    .await;

    let producer = Arc::new(Producer::new(core, ProducerOptions::new(EXCHANGE)));
    producer.connect().await.unwrap();

    let sender = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .send::<serde_json::Value, _>(
                    "slowish",
                    &serde_json::json!({}),
                    SendOptions::default().without_timeout(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(producer.pending_requests(), 1);

    let result = producer
        .shutdown(
            ShutdownOptions::default().with_timeout(Duration::from_millis(2_000)),
        )
        .await;
    assert!(result.success);
    assert_eq!(result.pending_count, 0);
    assert!(!result.timed_out);

    let reply = sender.await.unwrap().unwrap();
    assert_eq!(reply, serde_json::json!({"pong": true}));
}
