// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Consumer
//!
//! Binds handlers to routing keys and processes deliveries from the main
//! queue: decode, run the middleware chain, then ack. A failing handler
//! parks the message on the retry queue with an incremented `x-retry-count`
//! and a per-message TTL; the broker's dead-lettering returns it to the
//! main queue after the delay, no client-side timer involved. Exhausted
//! messages are copied to the DLQ. Each delivery is acked exactly once.

use crate::connection::{ChannelHandle, ChannelSetup, ConnectionCore};
use crate::errors::ClientError;
use crate::events::ClientEvent;
use crate::handler::{HandlerContext, HandlerRegistry, MessageHandler, Replier, RouteOptions};
use crate::middleware::{run_chain, Middleware};
use crate::otel;
use crate::shutdown::{ShutdownOptions, ShutdownResult};
use crate::topology::{
    dlq_queue, retry_queue, ConsumerTopology, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use crate::transport::{
    BrokerChannel, Delivery, DeliveryHandler, HeaderValue, MessageProperties,
};
use opentelemetry::global;
use opentelemetry::trace::{Span, Status};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consumer-level retry defaults; routes can override per key.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: true,
            max_retries: 3,
            ttl: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        RetryPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Options for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Names the main queue and, unless overridden, the primary exchange.
    pub app_name: String,
    pub exchange: Option<String>,
    pub prefetch: Option<u16>,
    pub retry: RetryPolicy,
}

impl ConsumerOptions {
    pub fn new(app_name: &str) -> Self {
        ConsumerOptions {
            app_name: app_name.to_owned(),
            exchange: None,
            prefetch: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Options for [`Consumer::listen`].
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Overrides the consumer-level prefetch for this listen.
    pub prefetch: Option<u16>,
}

enum Outcome {
    Ack,
    Retry {
        next_count: u32,
        ttl: Duration,
        original_key: String,
    },
    DeadLetter,
}

struct ConsumerShared {
    retry: RetryPolicy,
    app_name: String,
    exchange: String,
    registry: Mutex<HandlerRegistry>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    in_flight: AtomicUsize,
    listening: AtomicBool,
    prefetch: Mutex<Option<u16>>,
    consumer_tag: Mutex<Option<String>>,
}

/// Consumes deliveries for one application queue.
pub struct Consumer {
    core: Arc<ConnectionCore>,
    shared: Arc<ConsumerShared>,
    channel: Mutex<Option<ChannelHandle>>,
    shutdown_done: AtomicBool,
}

impl Consumer {
    pub fn new(core: Arc<ConnectionCore>, options: ConsumerOptions) -> Self {
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| options.app_name.clone());
        let prefetch = options.prefetch;
        Consumer {
            core,
            shared: Arc::new(ConsumerShared {
                retry: options.retry,
                app_name: options.app_name,
                exchange,
                registry: Mutex::new(HandlerRegistry::new()),
                middlewares: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                listening: AtomicBool::new(false),
                prefetch: Mutex::new(prefetch),
                consumer_tag: Mutex::new(None),
            }),
            channel: Mutex::new(None),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Registers a handler for a routing key. No I/O; call before
    /// [`Consumer::listen`] so the key is bound at topology declaration.
    /// The last registration for a key wins.
    pub fn on(&self, routing_key: &str, handler: Arc<dyn MessageHandler>, options: RouteOptions) {
        self.shared
            .registry
            .lock()
            .unwrap()
            .insert(routing_key, handler, options);
    }

    /// Appends a middleware; the first registered runs first.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.shared.middlewares.lock().unwrap().push(middleware);
    }

    /// Lifecycle events mirrored from the connection core.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.subscribe()
    }

    /// Currently executing handlers.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Declares the topology and installs the main-queue consumer. The same
    /// setup re-runs automatically on every channel recreated after a
    /// reconnect, including the remembered prefetch.
    pub async fn listen(&self, options: ListenOptions) -> Result<(), ClientError> {
        if let Some(prefetch) = options.prefetch {
            *self.shared.prefetch.lock().unwrap() = Some(prefetch);
        }
        self.shared.listening.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let setup: ChannelSetup = Arc::new(move |channel| {
            let shared = shared.clone();
            Box::pin(async move { shared.setup_channel(channel).await })
        });
        let handle = self.core.create_channel(Some(setup)).await?;
        *self.channel.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops consuming, drains in-flight handlers, and closes the channel.
    ///
    /// Without `force` it waits until in-flight handlers finish or the
    /// timeout elapses. Repeated calls return immediately with a clean
    /// result.
    pub async fn shutdown(&self, options: ShutdownOptions) -> ShutdownResult {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return ShutdownResult::clean();
        }
        self.shared.listening.store(false, Ordering::SeqCst);

        let tag = self.shared.consumer_tag.lock().unwrap().take();
        let handle = self.channel.lock().unwrap().take();

        if let (Some(tag), Some(handle)) = (&tag, &handle) {
            if let Some(channel) = handle.channel() {
                if let Err(err) = channel.cancel(tag).await {
                    debug!(error = err.to_string(), "ignoring consumer cancel failure");
                }
            }
        }

        let deadline = Instant::now() + options.timeout;
        let mut deadline_reached = false;
        if !options.force {
            loop {
                if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    deadline_reached = true;
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }
        let pending = self.shared.in_flight.load(Ordering::SeqCst);

        if let Some(handle) = handle {
            self.core.unregister_channel(&handle);
            if let Some(channel) = handle.channel() {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "ignoring channel close failure");
                }
            }
        }

        ShutdownResult {
            success: pending == 0,
            pending_count: pending,
            timed_out: deadline_reached && pending > 0,
        }
    }
}

impl ConsumerShared {
    async fn setup_channel(
        self: Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), ClientError> {
        let keys = self.registry.lock().unwrap().keys();
        let topology = ConsumerTopology::new(
            &self.app_name,
            &self.exchange,
            self.retry.ttl.as_millis() as u64,
        );
        topology.declare(channel.as_ref(), &keys).await?;

        let prefetch = *self.prefetch.lock().unwrap();
        if let Some(count) = prefetch {
            channel.prefetch(count).await?;
        }

        if self.listening.load(Ordering::SeqCst) {
            let shared = self.clone();
            let dispatch_channel = channel.clone();
            let handler: DeliveryHandler = Arc::new(move |delivery| {
                let shared = shared.clone();
                let channel = dispatch_channel.clone();
                Box::pin(async move { shared.dispatch(channel, delivery).await })
            });
            let tag = channel.consume(&self.app_name, false, handler).await?;
            *self.consumer_tag.lock().unwrap() = Some(tag);
        }
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.process(&channel, &delivery).await;

        match outcome {
            Outcome::Ack => {}
            Outcome::Retry {
                next_count,
                ttl,
                original_key,
            } => {
                let mut headers = delivery.properties.headers.clone();
                headers.insert(
                    HEADER_RETRY_COUNT.to_owned(),
                    HeaderValue::Int(i64::from(next_count)),
                );
                headers.insert(
                    HEADER_ORIGINAL_ROUTING_KEY.to_owned(),
                    HeaderValue::String(original_key),
                );
                // The retry travels as a fresh message with the original
                // properties so an RPC reply target survives the cycle.
                let mut properties = delivery.properties.clone();
                properties.headers = headers;
                properties.expiration = Some(ttl.as_millis().to_string());
                properties.persistent = true;
                // Parked on the retry queue until the TTL fires; the queue's
                // dead-letter routing then returns it to the main queue
                // through the primary exchange.
                if let Err(err) = channel
                    .send_to_queue(
                        &retry_queue(&self.app_name),
                        &delivery.payload,
                        properties,
                    )
                    .await
                {
                    error!(error = err.to_string(), "failed to park message for retry");
                }
            }
            Outcome::DeadLetter => {
                let properties = MessageProperties {
                    headers: delivery.properties.headers.clone(),
                    ..MessageProperties::json()
                };
                if let Err(err) = channel
                    .send_to_queue(&dlq_queue(&self.app_name), &delivery.payload, properties)
                    .await
                {
                    error!(error = err.to_string(), "failed to publish to dlq");
                }
            }
        }

        // The original delivery is acked exactly once regardless of outcome;
        // retries travel as new messages.
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            error!(error = err.to_string(), "error whiling ack msg");
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn process(&self, channel: &Arc<dyn BrokerChannel>, delivery: &Delivery) -> Outcome {
        let retry_count = delivery
            .properties
            .headers
            .get(HEADER_RETRY_COUNT)
            .and_then(|value| value.as_i64())
            .unwrap_or(0)
            .max(0) as u32;
        // Retried messages come back under the requeue key; their original
        // routing key travels in the headers and is what handlers see.
        let routing_key = delivery
            .properties
            .headers
            .get(HEADER_ORIGINAL_ROUTING_KEY)
            .and_then(|value| value.as_str())
            .unwrap_or(delivery.routing_key.as_str())
            .to_owned();
        let routing_key = routing_key.as_str();

        let Some(entry) = self.registry.lock().unwrap().get(routing_key).cloned() else {
            warn!(routing_key, "no handler registered; dropping message");
            return Outcome::Ack;
        };

        let content: serde_json::Value = match serde_json::from_slice(&delivery.payload) {
            Ok(value) => value,
            Err(err) => {
                // Malformed messages must not loop through the retry cycle.
                warn!(
                    routing_key,
                    error = err.to_string(),
                    "malformed payload; dropping message"
                );
                return Outcome::Ack;
            }
        };

        let ctx = HandlerContext {
            content,
            routing_key: routing_key.to_owned(),
            headers: delivery.properties.headers.clone(),
        };
        let replier = Replier::new(channel.clone(), &delivery.properties);
        let middlewares = self.middlewares.lock().unwrap().clone();

        let tracer = global::tracer("courier.consumer");
        let (_cx, mut span) = otel::consumer_span(&ctx.headers, &tracer, routing_key);

        match run_chain(&middlewares, &entry.handler, &ctx, &replier).await {
            Ok(()) => {
                debug!(routing_key, "message successfully processed");
                span.set_status(Status::Ok);
                Outcome::Ack
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failed"),
                });
                let enabled = entry.options.retry_enabled.unwrap_or(self.retry.enabled);
                let max_retries = entry.options.max_retries.unwrap_or(self.retry.max_retries);
                let ttl = entry.options.retry_ttl.unwrap_or(self.retry.ttl);
                if enabled && retry_count < max_retries {
                    warn!(
                        routing_key,
                        retry_count,
                        error = err.to_string(),
                        "handler failed; scheduling retry"
                    );
                    Outcome::Retry {
                        next_count: retry_count + 1,
                        ttl,
                        original_key: routing_key.to_owned(),
                    }
                } else {
                    error!(
                        routing_key,
                        retry_count,
                        error = err.to_string(),
                        "handler failed; sending to dlq"
                    );
                    Outcome::DeadLetter
                }
            }
        }
    }
}
