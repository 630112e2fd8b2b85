// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Test Doubles
//!
//! A scriptable in-memory broker implementing the [`crate::transport`]
//! traits, used by this crate's own test suite and available to downstream
//! crates. It models the slice of AMQP the client relies on: direct-exchange
//! routing with literal binding-key matching, default-exchange sends,
//! per-message expiration with dead-lettering, exclusive server-named
//! queues, explicit acks, and broker-initiated connection loss.

use crate::errors::ClientError;
use crate::exchange::ExchangeKind;
use crate::topology::{HEADER_DEAD_LETTER_EXCHANGE, HEADER_DEAD_LETTER_ROUTING_KEY, HEADER_MESSAGE_TTL};
use crate::transport::{
    BrokerChannel, BrokerConnection, CloseHandler, ConnectOptions, Delivery, DeliveryHandler,
    MessageProperties, QueueOptions, Transport,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Clone)]
struct ConsumerReg {
    tag: String,
    handler: DeliveryHandler,
    connection_id: u64,
    channel_id: u64,
    no_ack: bool,
}

struct QueueState {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumer: Option<ConsumerReg>,
    owner_connection: Option<u64>,
}

struct UnackedEntry {
    queue: String,
    routing_key: String,
    message: StoredMessage,
    connection_id: u64,
    channel_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, UnackedEntry>,
    acks: HashMap<String, usize>,
    prefetches: Vec<u16>,
    connections: Vec<Weak<MemoryConnection>>,
    next_delivery_tag: u64,
    next_message_id: u64,
    next_connection_id: u64,
    next_channel_id: u64,
    publish_accepted: bool,
}

type SharedState = Arc<Mutex<BrokerState>>;

/// In-memory broker shared by every connection of its transports.
#[derive(Clone)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                publish_accepted: true,
                ..Default::default()
            })),
        }
    }

    /// A transport dialing into this broker.
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
            connect_delay: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Injects a message as if published by an external client.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) {
        route(
            &self.state,
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
            properties,
        );
    }

    /// Acks recorded for deliveries with this routing key.
    pub fn ack_count(&self, routing_key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .acks
            .get(routing_key)
            .copied()
            .unwrap_or(0)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(name)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Queued (undelivered) messages as payload/properties pairs.
    pub fn messages(&self, queue: &str) -> Vec<(Vec<u8>, MessageProperties)> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| (m.payload.clone(), m.properties.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetches.last().copied()
    }

    /// Makes subsequent channel publishes report a full transport buffer.
    pub fn set_publish_accepted(&self, accepted: bool) {
        self.state.lock().unwrap().publish_accepted = accepted;
    }

    /// Severs every live connection as if the broker closed them: close
    /// handlers fire, consumers are dropped, exclusive queues vanish, and
    /// unacked deliveries are requeued for redelivery.
    pub fn drop_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut state = self.state.lock().unwrap();
            let live = state
                .connections
                .drain(..)
                .filter_map(|weak| weak.upgrade())
                .collect::<Vec<_>>();
            for conn in &live {
                cleanup_connection_locked(&mut state, conn.id);
            }
            live
        };
        for conn in connections {
            conn.sever("connection closed by broker");
        }
    }

    fn register_connection(&self, conn: &Arc<MemoryConnection>) {
        self.state
            .lock()
            .unwrap()
            .connections
            .push(Arc::downgrade(conn));
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a connection's consumers and exclusive queues and requeues its
/// unacked deliveries. Caller holds the state lock.
fn cleanup_connection_locked(state: &mut BrokerState, connection_id: u64) {
    for queue in state.queues.values_mut() {
        if queue
            .consumer
            .as_ref()
            .map(|c| c.connection_id == connection_id)
            .unwrap_or(false)
        {
            queue.consumer = None;
        }
    }
    state
        .queues
        .retain(|_, q| q.owner_connection != Some(connection_id));

    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, e)| e.connection_id == connection_id)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in tags {
        if let Some(entry) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }
}

/// Routes a publish through an exchange to its bound queues. The default
/// exchange addresses the queue named by the routing key; named exchanges
/// use direct semantics with literal binding-key equality.
fn route(
    state: &SharedState,
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
) {
    let targets: Vec<String> = {
        let state = state.lock().unwrap();
        if exchange.is_empty() {
            if state.queues.contains_key(&routing_key) {
                vec![routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        }
    };
    for queue in targets {
        let id = {
            let mut state = state.lock().unwrap();
            state.next_message_id += 1;
            state.next_message_id
        };
        enqueue(
            state,
            queue,
            StoredMessage {
                id,
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                payload: payload.clone(),
                properties: properties.clone(),
                redelivered: false,
            },
        );
    }
}

fn enqueue(state: &SharedState, queue_name: String, message: StoredMessage) {
    let message_id = message.id;
    let ttl = {
        let mut state = state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(&queue_name) else {
            return;
        };
        let per_message = message
            .properties
            .expiration
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok());
        let per_queue = queue
            .options
            .arguments
            .get(HEADER_MESSAGE_TTL)
            .and_then(|v| v.as_i64())
            .map(|v| v.max(0) as u64);
        queue.messages.push_back(message);
        per_message.or(per_queue)
    };
    pump(state, &queue_name);
    if let Some(ttl) = ttl {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl)).await;
            expire(&state, &queue_name, message_id);
        });
    }
}

/// Delivers queued messages to the queue's consumer, one spawned handler
/// invocation per message.
fn pump(state: &SharedState, queue_name: &str) {
    while let Some((handler, delivery)) = take_delivery(state, queue_name) {
        tokio::spawn(handler(delivery));
    }
}

fn take_delivery(state: &SharedState, queue_name: &str) -> Option<(DeliveryHandler, Delivery)> {
    let mut state = state.lock().unwrap();
    let tag = state.next_delivery_tag + 1;
    let queue = state.queues.get_mut(queue_name)?;
    let consumer = queue.consumer.clone()?;
    let message = queue.messages.pop_front()?;
    state.next_delivery_tag = tag;
    if !consumer.no_ack {
        state.unacked.insert(
            tag,
            UnackedEntry {
                queue: queue_name.to_owned(),
                routing_key: message.routing_key.clone(),
                message: message.clone(),
                connection_id: consumer.connection_id,
                channel_id: consumer.channel_id,
            },
        );
    }
    let delivery = Delivery {
        delivery_tag: tag,
        exchange: message.exchange.clone(),
        routing_key: message.routing_key.clone(),
        redelivered: message.redelivered,
        payload: message.payload.clone(),
        properties: message.properties.clone(),
    };
    Some((consumer.handler, delivery))
}

/// TTL expiry: if the message is still queued, dead-letter it through the
/// queue's DLX (or drop it without one).
fn expire(state: &SharedState, queue_name: &str, message_id: u64) {
    let dead = {
        let mut state = state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(position) = queue.messages.iter().position(|m| m.id == message_id) else {
            return;
        };
        let message = queue.messages.remove(position).unwrap();
        let dlx = queue
            .options
            .arguments
            .get(HEADER_DEAD_LETTER_EXCHANGE)
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let routing_key = queue
            .options
            .arguments
            .get(HEADER_DEAD_LETTER_ROUTING_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| message.routing_key.clone());
        dlx.map(|dlx| (dlx, routing_key, message))
    };
    if let Some((dlx, routing_key, message)) = dead {
        let mut properties = message.properties;
        properties.expiration = None;
        route(state, dlx, routing_key, message.payload, properties);
    }
}

/// Transport over a [`MemoryBroker`], with scripting knobs for connect
/// behavior.
pub struct MemoryTransport {
    broker: MemoryBroker,
    connect_delay: Mutex<Option<Duration>>,
    scripted_failures: Mutex<VecDeque<ClientError>>,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryTransport {
    /// Delays every subsequent connect by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Fails the next connect attempt with `err`, before any delay.
    pub fn fail_next_connect(&self, err: ClientError) {
        self.scripted_failures.lock().unwrap().push_back(err);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections on which `close()` was invoked locally.
    pub fn locally_closed_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|conn| conn.was_closed_locally())
            .count()
    }

    pub fn open_connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|conn| conn.is_open())
            .count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _uri: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripted_failures.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let id = {
            let mut state = self.broker.state.lock().unwrap();
            state.next_connection_id += 1;
            state.next_connection_id
        };
        let conn = Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            close_handlers: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        });
        self.broker.register_connection(&conn);
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// One simulated broker connection.
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
    closed_locally: AtomicBool,
    fired: AtomicBool,
    close_handlers: Mutex<Vec<CloseHandler>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    /// Whether the client side called `close()` on this connection.
    pub fn was_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
    }

    /// Broker-side severance: marks the connection closed and fires close
    /// handlers on it and its channels.
    fn sever(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let channels: Vec<Arc<MemoryChannel>> =
            self.channels.lock().unwrap().drain(..).collect();
        for channel in channels {
            channel.sever();
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<CloseHandler> = self.close_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler(Some(reason.to_owned()));
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ChannelError {
                message: "connection is closed".to_owned(),
                code: None,
            });
        }
        let id = {
            let mut state = self.broker.state.lock().unwrap();
            state.next_channel_id += 1;
            state.next_channel_id
        };
        let channel = Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            close_handlers: Mutex::new(Vec::new()),
            tags: Mutex::new(Vec::new()),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
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
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.broker.state.lock().unwrap();
        cleanup_connection_locked(&mut state, self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// One simulated channel.
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
    fired: AtomicBool,
    close_handlers: Mutex<Vec<CloseHandler>>,
    tags: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<CloseHandler> = self.close_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler(Some("channel closed".to_owned()));
        }
    }

    fn remove_consumers(&self) {
        let tags: Vec<String> = self.tags.lock().unwrap().drain(..).collect();
        let mut state = self.broker.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .map(|c| tags.contains(&c.tag))
                .unwrap_or(false)
            {
                queue.consumer = None;
            }
        }
        let stale: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, e)| e.channel_id == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in stale {
            if let Some(entry) = state.unacked.remove(&tag) {
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::ChannelError {
                message: "channel is closed".to_owned(),
                code: None,
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .unwrap()
            .exchanges
            .insert(name.to_owned(), kind);
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String, ClientError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };
        let mut state = self.broker.state.lock().unwrap();
        if !state.queues.contains_key(&name) {
            let owner = options.exclusive.then_some(self.connection_id);
            state.queues.insert(
                name.clone(),
                QueueState {
                    options,
                    messages: VecDeque::new(),
                    consumer: None,
                    owner_connection: owner,
                },
            );
        }
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let binding = Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            key: routing_key.to_owned(),
        };
        let mut state = self.broker.state.lock().unwrap();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.broker.state.lock().unwrap().prefetches.push(count);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError> {
        self.ensure_open()?;
        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        {
            let mut state = self.broker.state.lock().unwrap();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(ClientError::ConsumerError(format!(
                    "queue `{queue}` does not exist"
                )));
            };
            queue_state.consumer = Some(ConsumerReg {
                tag: tag.clone(),
                handler,
                connection_id: self.connection_id,
                channel_id: self.id,
                no_ack,
            });
        }
        self.tags.lock().unwrap().push(tag.clone());
        pump(&self.broker.state, queue);
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .map(|c| c.tag == consumer_tag)
                .unwrap_or(false)
            {
                queue.consumer = None;
            }
        }
        self.tags.lock().unwrap().retain(|t| t != consumer_tag);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, ClientError> {
        self.ensure_open()?;
        if !self.broker.state.lock().unwrap().publish_accepted {
            return Ok(false);
        }
        route(
            &self.broker.state,
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
            properties,
        );
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
        let mut state = self.broker.state.lock().unwrap();
        if let Some(entry) = state.unacked.remove(&delivery_tag) {
            *state.acks.entry(entry.routing_key).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn check_queue(&self, name: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        if self.broker.state.lock().unwrap().queues.contains_key(name) {
            Ok(())
        } else {
            Err(ClientError::DeclareQueueError(name.to_owned()))
        }
    }

    fn on_close(&self, handler: CloseHandler) {
        if self.fired.load(Ordering::SeqCst) {
            handler(None);
            return;
        }
        self.close_handlers.lock().unwrap().push(handler);
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::ChannelError {
                message: "channel already closed".to_owned(),
                code: None,
            });
        }
        self.remove_consumers();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
