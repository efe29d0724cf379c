// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The broker primitive the client is built on: connect, create channels,
//! declare topology, publish with properties, consume with manual
//! acknowledgement and ack/nack by delivery tag.
//!
//! Production code drives these traits with lapin (see [`crate::amqp`]),
//! tests use the in-memory broker from [`crate::memory`] or mockall mocks.

use crate::{config::ConnectionConfig, errors::AmqpError, exchange::Exchange, queue::Queue};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Header carrying the correlation id, checked before the property.
pub const CORRELATION_ID_HEADER: &str = "rabbitmq.message.correlation.id";

/// Properties sent along with a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Message type, the event type name.
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Correlation id from the header, falling back to the property.
    pub fn correlation_id(&self) -> Option<&str> {
        let present = |id: &&str| !id.trim().is_empty();
        self.headers
            .get(CORRELATION_ID_HEADER)
            .map(String::as_str)
            .filter(present)
            .or_else(|| self.correlation_id.as_deref().filter(present))
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref().filter(|r| !r.trim().is_empty())
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Stream of deliveries of one consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Opens broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cfg: &ConnectionConfig)
        -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel opened on a [`BrokerConnection`].
///
/// Implementations must accept concurrent calls from several tasks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &Exchange) -> Result<(), AmqpError>;

    async fn queue_declare(&self, queue: &Queue) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts consuming with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
