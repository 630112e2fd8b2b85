// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type for all client operations. The
//! `ClientError` enum covers connection establishment, channel management,
//! topology declaration, publishing, consuming, RPC, and shutdown scenarios.

use thiserror::Error;

/// Represents errors that can occur during client operations.
///
/// Variants that originate at the broker carry the AMQP reply code when one
/// was available, so they can be classified as recoverable or terminal (see
/// [`crate::classify`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {message}")]
    ConnectionError {
        message: String,
        code: Option<u16>,
    },

    /// The per-attempt connect timer expired before the transport resolved
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    /// Channel-level fault while the connection remains up
    #[error("channel error: {message}")]
    ChannelError {
        message: String,
        code: Option<u16>,
    },

    /// Authentication or authorization refused by the broker
    #[error("access refused: {0}")]
    AuthError(String),

    /// Topology mismatch, e.g. a queue redeclared with different arguments
    #[error("precondition failed: {0}")]
    PreconditionError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error installing or running a consumer
    #[error("consumer error: {0}")]
    ConsumerError(String),

    /// Transport-level publish failed (buffer full or channel closed)
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Error parsing or encoding a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckError,

    /// A user handler failed; routed to retry or DLQ, never to the producer
    #[error("handler error: {0}")]
    HandlerError(String),

    /// The producer did not receive a reply before the deadline
    #[error("request timed out")]
    RequestTimeout,

    /// Operation attempted before `connect()` or after the channel was lost
    #[error("client is not connected")]
    NotConnected,

    /// Pending request rejected because the client shut down
    #[error("client shutdown: request cancelled")]
    ShutdownCancelled,

    /// The reconnection loop exhausted its attempt budget
    #[error("reconnection gave up after {0} attempts")]
    MaxReconnectAttempts(u32),
}

impl ClientError {
    /// Wraps an arbitrary handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        ClientError::HandlerError(err.to_string())
    }

    /// The AMQP reply code attached to this error, if any.
    pub fn amqp_code(&self) -> Option<u16> {
        match self {
            ClientError::ConnectionError { code, .. } | ClientError::ChannelError { code, .. } => {
                *code
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::ParsePayloadError(err.to_string())
    }
}
