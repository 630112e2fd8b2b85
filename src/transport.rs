// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The connection core, consumer, and producer never talk to an AMQP library
//! directly; they go through the traits in this module. The production
//! implementation over `lapin` lives in [`crate::amqp`], and an in-memory
//! implementation for tests lives in [`crate::testing`].
//!
//! The traits deliberately mirror the small slice of AMQP 0-9-1 the client
//! needs: declare/bind topology, publish, consume with explicit acks, and
//! observe connection/channel loss.

use crate::errors::ClientError;
use crate::exchange::ExchangeKind;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single message header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::String(v.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::String(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

/// Message headers as an ordered map.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Properties attached to a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL, milliseconds rendered as a string per AMQP convention.
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub headers: Headers,
}

impl MessageProperties {
    /// JSON payload properties with persistence on, the library default.
    pub fn json() -> Self {
        MessageProperties {
            content_type: Some("application/json".to_owned()),
            persistent: true,
            ..Default::default()
        }
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Options for queue declaration.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Broker arguments (`x-message-ttl`, `x-dead-letter-exchange`, ...).
    pub arguments: Headers,
}

impl QueueOptions {
    pub fn durable() -> Self {
        QueueOptions {
            durable: true,
            ..Default::default()
        }
    }

    /// Server-named exclusive queue, deleted with its connection.
    pub fn exclusive() -> Self {
        QueueOptions {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Options passed to [`Transport::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    /// Connection name shown in broker management UIs.
    pub connection_name: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            heartbeat: 60,
            connection_name: None,
        }
    }
}

/// Callback invoked for each delivery on an installed consumer.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked once when a connection or channel is lost.
pub type CloseHandler = Box<dyn FnOnce(Option<String>) + Send>;

/// Dials broker connections. One implementation per backing transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError>;
}

impl std::fmt::Debug for dyn BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn BrokerConnection").finish_non_exhaustive()
    }
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ClientError>;

    /// Registers a handler fired once if the connection is lost without a
    /// local `close()` call. Handlers registered after the loss fire
    /// immediately.
    fn on_close(&self, handler: CloseHandler);

    async fn close(&self) -> Result<(), ClientError>;

    fn is_open(&self) -> bool;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ClientError>;

    /// Declares a queue and returns its broker-side name. Pass an empty name
    /// with [`QueueOptions::exclusive`] for a server-named queue.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String, ClientError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError>;

    async fn prefetch(&self, count: u16) -> Result<(), ClientError>;

    /// Installs a consumer and returns its consumer tag.
    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ClientError>;

    /// Publishes to an exchange. Returns `false` when the transport refused
    /// the frame without an error (write buffer full).
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, ClientError>;

    /// Publishes straight to a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, ClientError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), ClientError>;

    async fn check_queue(&self, name: &str) -> Result<(), ClientError>;

    /// Registers a handler fired once if the channel dies while its
    /// connection stays up.
    fn on_close(&self, handler: CloseHandler);

    async fn close(&self) -> Result<(), ClientError>;

    fn is_open(&self) -> bool;
}
