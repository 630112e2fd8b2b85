// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # courier
//!
//! A resilient AMQP 0-9-1 client library: a reconnecting [`ConnectionCore`]
//! shared per broker URI, a [`Consumer`] that routes deliveries through a
//! middleware chain with TTL-based retry and dead-lettering, and a
//! [`Producer`] that correlates RPC replies over an exclusive reply queue.

mod otel;

pub mod amqp;
pub mod classify;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod middleware;
pub mod producer;
pub mod shutdown;
pub mod testing;
pub mod topology;
pub mod transport;

pub use connection::{
    ChannelHandle, ChannelSetup, ConnectionCore, ConnectionOptions, ConnectionState,
    ReconnectPolicy,
};
pub use consumer::{Consumer, ConsumerOptions, ListenOptions, RetryPolicy};
pub use errors::ClientError;
pub use events::ClientEvent;
pub use handler::{handler_fn, HandlerContext, MessageHandler, Replier, RouteOptions};
pub use middleware::{Middleware, Next};
pub use producer::{Producer, ProducerOptions, SendOptions};
pub use shutdown::{
    setup_graceful_shutdown, GracefulShutdownOptions, ShutdownOptions, ShutdownOrchestrator,
    ShutdownResult, ShutdownSummary,
};
pub use transport::{HeaderValue, Headers, MessageProperties};
