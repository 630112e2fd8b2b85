// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! Exchange kinds, the reserved-name guard, and broker-side exchange
//! assertion. Reserved exchanges are pre-declared by the broker; declaring
//! them is a protocol error, so [`assert_exchange`] skips them and
//! [`validate`] emits a non-fatal advisory instead.

use crate::errors::ClientError;
use crate::transport::BrokerChannel;
use tracing::warn;

/// The default (nameless) exchange.
pub const EXCHANGE_DEFAULT: &str = "";
/// Pre-declared direct exchange.
pub const EXCHANGE_AMQ_DIRECT: &str = "amq.direct";
/// Pre-declared fanout exchange.
pub const EXCHANGE_AMQ_FANOUT: &str = "amq.fanout";
/// Pre-declared topic exchange.
pub const EXCHANGE_AMQ_TOPIC: &str = "amq.topic";
/// Pre-declared headers exchange.
pub const EXCHANGE_AMQ_HEADERS: &str = "amq.headers";
/// Pre-declared match exchange.
pub const EXCHANGE_AMQ_MATCH: &str = "amq.match";

const RESERVED: &[&str] = &[
    EXCHANGE_DEFAULT,
    EXCHANGE_AMQ_DIRECT,
    EXCHANGE_AMQ_FANOUT,
    EXCHANGE_AMQ_TOPIC,
    EXCHANGE_AMQ_HEADERS,
    EXCHANGE_AMQ_MATCH,
];

/// Represents the standard exchange types.
///
/// Routing in this library relies on Direct (binding key equals routing key);
/// the other kinds exist so custom exchanges can still be asserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Whether the name belongs to the broker's pre-declared exchange set.
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// Emits an advisory for reserved names and continues.
pub fn validate(name: &str) {
    if is_reserved(name) {
        warn!(
            exchange = name,
            "exchange name is reserved; it will not be declared"
        );
    }
}

/// Declares the exchange on the broker unless the name is reserved.
///
/// Reserved names already exist broker-side and redeclaring them is a
/// protocol error, so this is a no-op for them.
pub async fn assert_exchange(
    channel: &dyn BrokerChannel,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<(), ClientError> {
    if is_reserved(name) {
        validate(name);
        return Ok(());
    }
    channel.assert_exchange(name, kind, durable).await
}
