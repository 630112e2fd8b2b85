// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Production implementation of the [`crate::transport`] traits over
//! `lapin`. Besides the thin call-throughs this module owns the two lossy
//! boundaries: header conversion between this crate's [`Headers`] and
//! AMQP field tables, and error mapping that preserves broker reply codes
//! for classification.

use crate::errors::ClientError;
use crate::exchange::ExchangeKind;
use crate::transport::{
    BrokerChannel, BrokerConnection, CloseHandler, ConnectOptions, Delivery, DeliveryHandler,
    HeaderValue, Headers, MessageProperties, QueueOptions, Transport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::basic::AMQPProperties;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const CHANNEL_WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Transport over a real broker via `lapin`.
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        AmqpTransport
    }
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        debug!("creating amqp connection...");
        let mut props = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            props = props.with_connection_name(LongString::from(name.clone()));
        }

        let uri = uri_with_heartbeat(uri, options.heartbeat);
        let conn = lapin::Connection::connect(&uri, props)
            .await
            .map_err(map_connect_error)?;
        debug!("amqp connected");

        let wrapped = Arc::new(AmqpConnection {
            inner: conn,
            close_handlers: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
        });
        wrapped.install_error_hook();
        Ok(wrapped)
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    close_handlers: Mutex<Vec<CloseHandler>>,
    fired: AtomicBool,
    closed_locally: AtomicBool,
}

impl AmqpConnection {
    fn install_error_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.inner.on_error(move |err| {
            if let Some(conn) = weak.upgrade() {
                conn.fire_close(Some(err.to_string()));
            }
        });
    }

    fn fire_close(&self, reason: Option<String>) {
        if self.closed_locally.load(Ordering::SeqCst) {
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<CloseHandler> = self.close_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler(reason.clone());
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ClientError> {
        debug!("creating amqp channel...");
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(map_channel_error)?;
        let wrapped = Arc::new(AmqpChannel {
            inner: channel,
            close_handlers: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
        });
        AmqpChannel::spawn_liveness_watch(&wrapped);
        Ok(wrapped)
    }

    fn on_close(&self, handler: CloseHandler) {
        if self.fired.load(Ordering::SeqCst) {
            handler(None);
            return;
        }
        self.close_handlers.lock().unwrap().push(handler);
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed_locally.store(true, Ordering::SeqCst);
        self.inner
            .close(200, "closed by client")
            .await
            .map_err(map_connect_error)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    close_handlers: Mutex<Vec<CloseHandler>>,
    fired: AtomicBool,
    closed_locally: AtomicBool,
}

impl AmqpChannel {
    /// lapin surfaces channel death through status, not a callback; poll it
    /// and fan the first observed close out to registered handlers.
    fn spawn_liveness_watch(channel: &Arc<AmqpChannel>) {
        let weak = Arc::downgrade(channel);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHANNEL_WATCH_INTERVAL).await;
                let Some(channel) = weak.upgrade() else { return };
                if channel.closed_locally.load(Ordering::SeqCst) {
                    return;
                }
                if !channel.inner.status().connected() {
                    channel.fire_close(Some("channel closed".to_owned()));
                    return;
                }
            }
        });
    }

    fn fire_close(&self, reason: Option<String>) {
        if self.closed_locally.load(Ordering::SeqCst) {
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<CloseHandler> = self.close_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler(reason.clone());
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ClientError> {
        self.inner
            .exchange_declare(
                name,
                map_exchange_kind(kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                ClientError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String, ClientError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                headers_to_field_table(&options.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                match reply_code(&err) {
                    Some(406) => ClientError::PreconditionError(err.to_string()),
                    _ => ClientError::DeclareQueueError(name.to_owned()),
                }
            })?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                ClientError::BindQueueError(queue.to_owned(), exchange.to_owned())
            })
    }

    async fn prefetch(&self, count: u16) -> Result<(), ClientError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_channel_error)
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError> {
        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                ClientError::ConsumerError(err.to_string())
            })?;

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => handler(convert_delivery(delivery)).await,
                    Err(err) => error!(error = err.to_string(), "error receiving delivery"),
                }
            }
        });

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ClientError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, ClientError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(&properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                ClientError::PublishError(err.to_string())
            })?;
        Ok(true)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, ClientError> {
        self.publish("", queue, payload, properties).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ClientError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                ClientError::AckError
            })
    }

    async fn check_queue(&self, name: &str) -> Result<(), ClientError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|_| ClientError::DeclareQueueError(name.to_owned()))
    }

    fn on_close(&self, handler: CloseHandler) {
        if self.fired.load(Ordering::SeqCst) {
            handler(None);
            return;
        }
        self.close_handlers.lock().unwrap().push(handler);
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed_locally.store(true, Ordering::SeqCst);
        self.inner
            .close(200, "closed by client")
            .await
            .map_err(map_channel_error)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

fn uri_with_heartbeat(uri: &str, heartbeat: u16) -> String {
    if uri.contains("heartbeat=") {
        uri.to_owned()
    } else if uri.contains('?') {
        format!("{uri}&heartbeat={heartbeat}")
    } else {
        format!("{uri}?heartbeat={heartbeat}")
    }
}

fn map_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn reply_code(err: &lapin::Error) -> Option<u16> {
    match err {
        lapin::Error::ProtocolError(e) => Some(e.get_id()),
        _ => None,
    }
}

fn map_connect_error(err: lapin::Error) -> ClientError {
    let code = reply_code(&err);
    let message = err.to_string();
    if code == Some(403)
        || message.contains("ACCESS_REFUSED")
        || message.to_ascii_lowercase().contains("authentication")
    {
        ClientError::AuthError(message)
    } else {
        ClientError::ConnectionError { message, code }
    }
}

fn map_channel_error(err: lapin::Error) -> ClientError {
    let code = reply_code(&err);
    let message = err.to_string();
    match code {
        Some(406) => ClientError::PreconditionError(message),
        _ => ClientError::ChannelError { message, code },
    }
}

fn headers_to_field_table(headers: &Headers) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::new();
    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };
        table.insert(ShortString::from(key.clone()), amqp_value);
    }
    FieldTable::from(table)
}

fn field_table_to_headers(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in table.inner() {
        let converted = match value {
            AMQPValue::LongString(v) => Some(HeaderValue::String(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some(HeaderValue::String(v.as_str().to_owned())),
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
            _ => None,
        };
        if let Some(value) = converted {
            headers.insert(key.as_str().to_owned(), value);
        }
    }
    headers
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut bp = BasicProperties::default();
    if let Some(content_type) = &props.content_type {
        bp = bp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(id) = &props.correlation_id {
        bp = bp.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        bp = bp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = &props.expiration {
        bp = bp.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(id) = &props.message_id {
        bp = bp.with_message_id(ShortString::from(id.clone()));
    }
    if props.persistent {
        bp = bp.with_delivery_mode(2);
    }
    if !props.headers.is_empty() {
        bp = bp.with_headers(headers_to_field_table(&props.headers));
    }
    bp
}

fn from_basic_properties(props: &AMQPProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_owned()),
        reply_to: props.reply_to().as_ref().map(|v| v.as_str().to_owned()),
        expiration: props.expiration().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        persistent: props.delivery_mode() == &Some(2),
        headers: props
            .headers()
            .as_ref()
            .map(field_table_to_headers)
            .unwrap_or_default(),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        payload: delivery.data,
    }
}
