// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Handlers and Routing
//!
//! User handlers receive a decoded [`HandlerContext`] and a [`Replier`]. The
//! [`HandlerRegistry`] maps routing keys to handlers with optional per-route
//! retry overrides; the last registration for a key wins.

use crate::errors::ClientError;
use crate::transport::{BrokerChannel, Headers, MessageProperties};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Everything a handler sees about one delivery.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Payload decoded as JSON.
    pub content: serde_json::Value,
    pub routing_key: String,
    pub headers: Headers,
}

/// Sends an RPC response for the current delivery.
///
/// The replier is live only when the delivery carried both `reply_to` and
/// `correlation_id`; otherwise [`Replier::send`] is a no-op. Reply delivery
/// is independent of whether the middleware chain runs to completion.
#[derive(Clone)]
pub struct Replier {
    channel: Option<Arc<dyn BrokerChannel>>,
    target: Option<(String, String)>,
}

impl Replier {
    pub fn new(channel: Arc<dyn BrokerChannel>, properties: &MessageProperties) -> Self {
        let target = match (&properties.reply_to, &properties.correlation_id) {
            (Some(queue), Some(id)) => Some((queue.clone(), id.clone())),
            _ => None,
        };
        Replier {
            channel: Some(channel),
            target,
        }
    }

    /// A replier that drops everything. Used for deliveries without RPC
    /// properties and in tests.
    pub fn noop() -> Self {
        Replier {
            channel: None,
            target: None,
        }
    }

    /// Whether a reply target exists for this delivery.
    pub fn is_live(&self) -> bool {
        self.channel.is_some() && self.target.is_some()
    }

    /// JSON-encodes `body` and sends it to the requester's reply queue with
    /// the request's correlation id. No-op without a reply target.
    pub async fn send<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), ClientError> {
        let (Some(channel), Some((queue, correlation_id))) = (&self.channel, &self.target) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(body)?;
        let properties = MessageProperties {
            correlation_id: Some(correlation_id.clone()),
            ..MessageProperties::json()
        };
        channel
            .send_to_queue(queue, &payload, properties)
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier")
            .field("target", &self.target)
            .finish()
    }
}

/// Processes one delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, reply: &Replier) -> Result<(), ClientError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Replier) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ClientError>> + Send,
{
    async fn handle(&self, ctx: &HandlerContext, reply: &Replier) -> Result<(), ClientError> {
        (self.0)(ctx.clone(), reply.clone()).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(HandlerContext, Replier) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-route retry overrides; unset fields fall back to the consumer policy.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub max_retries: Option<u32>,
    pub retry_ttl: Option<Duration>,
    pub retry_enabled: Option<bool>,
}

impl RouteOptions {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_retry_ttl(mut self, ttl: Duration) -> Self {
        self.retry_ttl = Some(ttl);
        self
    }

    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = Some(enabled);
        self
    }
}

/// A registered route.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn MessageHandler>,
    pub options: RouteOptions,
}

/// Routing-key to handler map. Keys are dot-delimited ASCII tokens.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            routes: HashMap::new(),
        }
    }

    /// Registers a handler for a routing key. Last registration wins.
    pub fn insert(&mut self, routing_key: &str, handler: Arc<dyn MessageHandler>, options: RouteOptions) {
        self.routes
            .insert(routing_key.to_owned(), HandlerEntry { handler, options });
    }

    pub fn get(&self, routing_key: &str) -> Option<&HandlerEntry> {
        self.routes.get(routing_key)
    }

    /// The registered keys, read at topology declaration time to bind the
    /// main queue.
    pub fn keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
