// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Naming conventions and broker-side declaration for the consumer's queue
//! trio: a main queue named after the application, a TTL'd retry queue whose
//! expired messages dead-letter back into the main queue through the primary
//! exchange, and a DLQ for exhausted messages. Declaration is idempotent
//! over broker state and re-runs on every channel (re)creation.

use crate::errors::ClientError;
use crate::exchange::{self, ExchangeKind};
use crate::transport::{BrokerChannel, HeaderValue, QueueOptions};
use tracing::debug;

/// Queue argument naming the dead letter exchange.
pub const HEADER_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key used when dead-lettering.
pub const HEADER_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument bounding how long a message may sit in the queue.
pub const HEADER_MESSAGE_TTL: &str = "x-message-ttl";

/// Message header carrying the delivery's retry attempt count.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Message header preserving the routing key of the first delivery.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// Binding key of the retry queue on the primary exchange. All consumers of
/// the same application share that exchange, so the retry binding must not
/// collide with any registered routing key.
pub const RETRY_BINDING_KEY: &str = "#";

/// Retry queue name for an application.
pub fn retry_queue(app: &str) -> String {
    format!("{app}.retry")
}

/// Dead letter queue name for an application.
pub fn dlq_queue(app: &str) -> String {
    format!("{app}.dlq")
}

/// The consumer-side queue/exchange layout for one application.
#[derive(Debug, Clone)]
pub struct ConsumerTopology {
    pub app: String,
    pub exchange: String,
    pub retry_ttl_ms: u64,
}

impl ConsumerTopology {
    pub fn new(app: &str, exchange: &str, retry_ttl_ms: u64) -> Self {
        ConsumerTopology {
            app: app.to_owned(),
            exchange: exchange.to_owned(),
            retry_ttl_ms,
        }
    }

    /// Declares the exchange, DLQ, retry queue, and main queue, then binds
    /// the main queue for each registered routing key.
    ///
    /// The main queue and retry queue both point their DLX at the primary
    /// exchange, keeping the retry cycle self-contained. Retries are parked
    /// on the retry queue; when its message TTL expires, the queue's
    /// dead-letter routing key (the application name, which the main queue
    /// is bound under) carries the message back into the main queue.
    /// Broker-rejected main-queue messages flow the other way through the
    /// `#` binding.
    pub async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        routing_keys: &[String],
    ) -> Result<(), ClientError> {
        exchange::assert_exchange(channel, &self.exchange, ExchangeKind::Direct, true).await?;

        let dlq = dlq_queue(&self.app);
        debug!(queue = dlq.as_str(), "declaring dead letter queue");
        channel.assert_queue(&dlq, QueueOptions::durable()).await?;

        let retry = retry_queue(&self.app);
        debug!(queue = retry.as_str(), "declaring retry queue");
        channel
            .assert_queue(
                &retry,
                QueueOptions::durable()
                    .with_argument(
                        HEADER_DEAD_LETTER_EXCHANGE,
                        HeaderValue::from(self.exchange.clone()),
                    )
                    .with_argument(
                        HEADER_DEAD_LETTER_ROUTING_KEY,
                        HeaderValue::from(self.app.clone()),
                    )
                    .with_argument(
                        HEADER_MESSAGE_TTL,
                        HeaderValue::Int(self.retry_ttl_ms as i64),
                    ),
            )
            .await?;
        channel
            .bind_queue(&retry, &self.exchange, RETRY_BINDING_KEY)
            .await?;

        debug!(queue = self.app.as_str(), "declaring main queue");
        channel
            .assert_queue(
                &self.app,
                QueueOptions::durable()
                    .with_argument(
                        HEADER_DEAD_LETTER_EXCHANGE,
                        HeaderValue::from(self.exchange.clone()),
                    )
                    .with_argument(
                        HEADER_DEAD_LETTER_ROUTING_KEY,
                        HeaderValue::from(RETRY_BINDING_KEY),
                    ),
            )
            .await?;

        // The requeue binding: expired retries come back under the app name.
        channel
            .bind_queue(&self.app, &self.exchange, &self.app)
            .await?;

        for key in routing_keys {
            debug!(
                queue = self.app.as_str(),
                exchange = self.exchange.as_str(),
                routing_key = key.as_str(),
                "binding main queue"
            );
            channel.bind_queue(&self.app, &self.exchange, key).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_the_app_convention() {
        assert_eq!(retry_queue("billing"), "billing.retry");
        assert_eq!(dlq_queue("billing"), "billing.dlq");
    }
}
