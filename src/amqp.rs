// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! [`Connector`], [`BrokerConnection`] and [`BrokerChannel`] implemented with
//! lapin. Every lapin error is logged where it happens and converted into the
//! matching [`AmqpError`] variant.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::Exchange,
    queue::Queue,
    transport::{
        BrokerChannel, BrokerConnection, Connector, DeliveryStream, InboundDelivery,
        MessageProperties,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, with TLS when the connection enables it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        cfg: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.name.clone()));
        let uri = cfg.uri();

        let conn = if cfg.ssl.enable {
            let cert_chain = match &cfg.ssl.ca_chain_path {
                Some(path) => Some(fs::read_to_string(path).map_err(|err| {
                    error!(error = err.to_string(), path, "failure to read the ca chain");
                    AmqpError::ConnectionError(format!("{}: {}", path, err))
                })?),
                None => None,
            };
            let tls = OwnedTLSConfig {
                identity: None,
                cert_chain,
            };
            Connection::connect_with_config(&uri, options, tls).await
        } else {
            Connection::connect(&uri, options).await
        }
        .map_err(|err| {
            error!(error = err.to_string(), host = cfg.host, "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;

        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let name = cfg.name.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), connection = name, "connection failure");
            flag.store(true, Ordering::SeqCst);
        });

        debug!(connection = cfg.name, "amqp connected");
        Ok(Arc::new(LapinConnection { conn, failed }))
    }
}

pub struct LapinConnection {
    conn: Connection,
    failed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.failed.load(Ordering::SeqCst) && self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, exchange: &Exchange) -> Result<(), AmqpError> {
        debug!(exchange = exchange.name, "creating exchange");

        self.channel
            .exchange_declare(
                &exchange.name,
                (&exchange.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(exchange.name.clone())
            })
    }

    async fn queue_declare(&self, queue: &Queue) -> Result<(), AmqpError> {
        debug!(queue = queue.name(), "creating queue");

        match self
            .channel
            .queue_declare(
                queue.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue.name(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(queue, exchange, routing_key, "binding queue to exchange");

        self.channel
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
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        confirm.await.map(|_| ()).map_err(|err| {
            error!(error = err.to_string(), "error confirming message");
            AmqpError::PublishingError(err.to_string())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let tag = consumer.tag().to_string();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(from_delivery(&tag, delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(delivery_mode) = props.delivery_mode {
        properties = properties.with_delivery_mode(delivery_mode);
    }
    if let Some(correlation_id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(message_id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(kind) = &props.kind {
        properties = properties.with_kind(ShortString::from(kind.clone()));
    }

    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    properties.with_headers(FieldTable::from(headers))
}

fn from_delivery(consumer_tag: &str, delivery: Delivery) -> InboundDelivery {
    let props = &delivery.properties;
    let short = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_owned(),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        properties: MessageProperties {
            content_type: short(props.content_type()),
            delivery_mode: *props.delivery_mode(),
            correlation_id: short(props.correlation_id()),
            reply_to: short(props.reply_to()),
            message_id: short(props.message_id()),
            kind: short(props.kind()),
            headers,
        },
        body: delivery.data,
    }
}

/// String form of the header values written by publishers; nested tables
/// and arrays are dropped.
fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(v.to_string()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        _ => None,
    }
}
