// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! Publishes messages and correlates RPC replies over an exclusive,
//! server-named reply queue. Every request registers a pending entry keyed
//! by a fresh correlation id; the entry is settled exactly once, by the
//! matching reply, its timeout timer, or shutdown. The reply queue and its
//! consumer are recreated by the channel setup function after reconnects,
//! and the pending registry survives the reconnection.

use crate::connection::{ChannelHandle, ChannelSetup, ConnectionCore};
use crate::errors::ClientError;
use crate::exchange::{self, ExchangeKind};
use crate::otel;
use crate::shutdown::{ShutdownOptions, ShutdownResult};
use crate::transport::{
    BrokerChannel, Delivery, DeliveryHandler, Headers, MessageProperties, QueueOptions,
};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Options for a [`Producer`].
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Primary exchange for outgoing messages.
    pub exchange: String,
}

impl ProducerOptions {
    pub fn new(exchange: &str) -> Self {
        ProducerOptions {
            exchange: exchange.to_owned(),
        }
    }
}

/// Options for [`Producer::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Reply deadline. `None` disables the timer entirely; the request is
    /// then settled only by a reply or shutdown.
    pub timeout: Option<Duration>,
    pub persistent: bool,
    pub headers: Headers,
    /// Copies the correlation id into the outgoing message's `id` field for
    /// frameworks that correlate on the body instead of the properties.
    pub mirror_id: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            timeout: Some(DEFAULT_SEND_TIMEOUT),
            persistent: true,
            headers: Headers::new(),
            mirror_id: false,
        }
    }
}

impl SendOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_header(mut self, key: &str, value: crate::transport::HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn with_mirror_id(mut self) -> Self {
        self.mirror_id = true;
        self
    }
}

struct PendingRequest {
    tx: oneshot::Sender<Result<serde_json::Value, ClientError>>,
    timer: Option<JoinHandle<()>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Publishes messages and awaits correlated replies.
pub struct Producer {
    core: Arc<ConnectionCore>,
    options: ProducerOptions,
    channel: Mutex<Option<ChannelHandle>>,
    reply_queue: Arc<Mutex<Option<String>>>,
    pending: PendingMap,
    connected: AtomicBool,
}

impl Producer {
    pub fn new(core: Arc<ConnectionCore>, options: ProducerOptions) -> Self {
        Producer {
            core,
            options,
            channel: Mutex::new(None),
            reply_queue: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(false),
        }
    }

    /// Acquires a channel whose setup declares the exchange, creates the
    /// exclusive reply queue, and installs the reply consumer. The setup
    /// re-runs after reconnects, refreshing the reply-queue name while the
    /// pending registry carries over.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let exchange = self.options.exchange.clone();
        let reply_queue = self.reply_queue.clone();
        let pending = self.pending.clone();

        let setup: ChannelSetup = Arc::new(move |channel| {
            let exchange = exchange.clone();
            let reply_queue = reply_queue.clone();
            let pending = pending.clone();
            Box::pin(async move {
                exchange::assert_exchange(channel.as_ref(), &exchange, ExchangeKind::Direct, true)
                    .await?;
                let name = channel.assert_queue("", QueueOptions::exclusive()).await?;
                let reply_channel = channel.clone();
                let handler: DeliveryHandler = Arc::new(move |delivery| {
                    let pending = pending.clone();
                    let channel = reply_channel.clone();
                    Box::pin(async move { dispatch_reply(pending, channel, delivery).await })
                });
                channel.consume(&name, false, handler).await?;
                *reply_queue.lock().unwrap() = Some(name);
                Ok(())
            })
        });

        let handle = self.core.create_channel(Some(setup)).await?;
        *self.channel.lock().unwrap() = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The current reply queue name, once connected.
    pub fn reply_queue(&self) -> Option<String> {
        self.reply_queue.lock().unwrap().clone()
    }

    /// Publishes `message` to `routing_key` and awaits the correlated reply,
    /// decoded as `T`.
    pub async fn send<T, M>(
        &self,
        routing_key: &str,
        message: &M,
        options: SendOptions,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        M: Serialize + ?Sized,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let channel = {
            let guard = self.channel.lock().unwrap();
            match guard.as_ref() {
                Some(handle) => handle.require()?,
                None => return Err(ClientError::NotConnected),
            }
        };
        let reply_to = self
            .reply_queue
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let correlation_id = Uuid::new_v4().to_string();
        let mut body = serde_json::to_value(message)?;
        if options.mirror_id {
            if let Some(object) = body.as_object_mut() {
                object.insert(
                    "id".to_owned(),
                    serde_json::Value::String(correlation_id.clone()),
                );
            }
        }
        let payload = serde_json::to_vec(&body)?;

        let (tx, rx) = oneshot::channel();
        let timer = options.timeout.map(|timeout| {
            let pending = self.pending.clone();
            let id = correlation_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(request) = pending.lock().unwrap().remove(&id) {
                    let _ = request.tx.send(Err(ClientError::RequestTimeout));
                }
            })
        });
        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), PendingRequest { tx, timer });

        let mut headers = options.headers.clone();
        otel::inject_context(&Context::current(), &mut headers);
        let properties = MessageProperties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(reply_to),
            message_id: Some(Uuid::new_v4().to_string()),
            persistent: options.persistent,
            headers,
            ..MessageProperties::json()
        };

        let accepted = match channel
            .publish(&self.options.exchange, routing_key, &payload, properties)
            .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                self.discard_pending(&correlation_id);
                return Err(err);
            }
        };
        if !accepted {
            self.discard_pending(&correlation_id);
            return Err(ClientError::PublishError("transport buffer full".to_owned()));
        }

        let settled = rx.await.map_err(|_| ClientError::ShutdownCancelled)?;
        let value = settled?;
        Ok(serde_json::from_value(value)?)
    }

    fn discard_pending(&self, correlation_id: &str) {
        if let Some(request) = self.pending.lock().unwrap().remove(correlation_id) {
            if let Some(timer) = request.timer {
                timer.abort();
            }
        }
    }

    /// Stops sending and settles the pending registry.
    ///
    /// With `force` every pending request is rejected immediately; without
    /// it the producer waits for outstanding replies up to the timeout and
    /// rejects whatever remains.
    pub async fn shutdown(&self, options: ShutdownOptions) -> ShutdownResult {
        self.connected.store(false, Ordering::SeqCst);

        let mut deadline_reached = false;
        if !options.force {
            let deadline = Instant::now() + options.timeout;
            loop {
                if self.pending.lock().unwrap().is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    deadline_reached = true;
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }

        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, request)| request).collect()
        };
        let pending_count = drained.len();
        for request in drained {
            if let Some(timer) = request.timer {
                timer.abort();
            }
            let _ = request.tx.send(Err(ClientError::ShutdownCancelled));
        }

        let handle = self.channel.lock().unwrap().take();
        if let Some(handle) = handle {
            self.core.unregister_channel(&handle);
            if let Some(channel) = handle.channel() {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "ignoring channel close failure");
                }
            }
        }

        ShutdownResult {
            success: true,
            pending_count,
            timed_out: deadline_reached && pending_count > 0,
        }
    }

    /// Alias for a forced shutdown.
    pub async fn close(&self) -> ShutdownResult {
        self.shutdown(ShutdownOptions::forced()).await
    }
}

async fn dispatch_reply(pending: PendingMap, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
    if let Err(err) = channel.ack(delivery.delivery_tag).await {
        error!(error = err.to_string(), "error whiling ack reply");
    }
    let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
        debug!("reply without correlation id dropped");
        return;
    };
    let entry = pending.lock().unwrap().remove(&correlation_id);
    let Some(request) = entry else {
        // Expected after a request timeout; the waiter is already gone.
        debug!(
            correlation_id = correlation_id.as_str(),
            "unmatched reply dropped"
        );
        return;
    };
    if let Some(timer) = request.timer {
        timer.abort();
    }
    let result = serde_json::from_slice::<serde_json::Value>(&delivery.payload)
        .map_err(|err| ClientError::ParsePayloadError(err.to_string()));
    let _ = request.tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_options_defaults() {
        let options = SendOptions::default();
        assert_eq!(options.timeout, Some(DEFAULT_SEND_TIMEOUT));
        assert!(options.persistent);
        assert!(options.headers.is_empty());
        assert!(!options.mirror_id);
    }

    #[test]
    fn send_options_builders() {
        let options = SendOptions::default()
            .with_timeout(Duration::from_millis(100))
            .with_persistent(false)
            .with_header("x-tenant", crate::transport::HeaderValue::from("acme"))
            .with_mirror_id();
        assert_eq!(options.timeout, Some(Duration::from_millis(100)));
        assert!(!options.persistent);
        assert!(options.mirror_id);
        assert_eq!(
            options.headers.get("x-tenant"),
            Some(&crate::transport::HeaderValue::from("acme"))
        );
        assert_eq!(SendOptions::default().without_timeout().timeout, None);
    }
}
