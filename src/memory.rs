// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing the transport traits, used to run the
//! client without RabbitMQ: in tests, or in applications wiring their
//! messaging up before a broker is available.
//!
//! Routing follows AMQP semantics for the default, direct, fanout and topic
//! exchanges. Headers exchanges deliver to every bound queue since binding
//! arguments are not modelled. Deliveries are dispatched round-robin to the
//! consumers of a queue; unacknowledged deliveries of a closed channel are
//! requeued.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, AMQ_DIRECT},
    queue::Queue,
    transport::{
        BrokerChannel, BrokerConnection, Connector, DeliveryStream, InboundDelivery,
        MessageProperties,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, warn};

/// A message as published to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    sender: UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PublishedMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: PublishedMessage,
}

struct BindingEntry {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingEntry>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    next_delivery_tag: u64,
    next_channel: u64,
    connections: Vec<Arc<AtomicBool>>,
    connections_opened: usize,
    failing_publishes: u32,
    failing_connects: u32,
}

impl Default for State {
    fn default() -> Self {
        let exchanges = [
            (String::new(), ExchangeKind::Direct),
            (AMQ_DIRECT.to_owned(), ExchangeKind::Direct),
            ("amq.fanout".to_owned(), ExchangeKind::Fanout),
            ("amq.topic".to_owned(), ExchangeKind::Topic),
            ("amq.headers".to_owned(), ExchangeKind::Headers),
        ]
        .into_iter()
        .collect();

        Self {
            exchanges,
            queues: HashMap::default(),
            bindings: vec![],
            unacked: HashMap::default(),
            published: vec![],
            acked: vec![],
            nacked: vec![],
            next_delivery_tag: 1,
            next_channel: 1,
            connections: vec![],
            connections_opened: 0,
            failing_publishes: 0,
            failing_connects: 0,
        }
    }
}

impl State {
    fn route(&mut self, message: PublishedMessage) -> Result<(), AmqpError> {
        let Some(kind) = self.exchanges.get(&message.exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange '{}'",
                message.exchange
            )));
        };

        let targets: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == message.exchange)
                .filter(|b| routes(kind, &b.routing_key, &message.routing_key))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        let mut delivered = false;
        for queue in targets {
            if self.queues.contains_key(&queue) {
                self.enqueue(&queue, message.clone());
                delivered = true;
            }
        }
        if !delivered {
            debug!(
                exchange = message.exchange,
                routing_key = message.routing_key,
                "message is unroutable, dropping it"
            );
        }

        Ok(())
    }

    /// Hands the message to the next live consumer or keeps it pending.
    fn enqueue(&mut self, queue: &str, message: PublishedMessage) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        while !state.consumers.is_empty() {
            let index = state.next_consumer % state.consumers.len();
            let consumer = &state.consumers[index];

            let delivery_tag = self.next_delivery_tag;
            let delivery = InboundDelivery {
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_ok() {
                self.next_delivery_tag += 1;
                state.next_consumer = index + 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_owned(),
                        channel: consumer.channel,
                        message,
                    },
                );
                return;
            }

            state.consumers.remove(index);
        }

        state.pending.push_back(message);
    }

    fn close_channel(&mut self, channel: u64) {
        for state in self.queues.values_mut() {
            state.consumers.retain(|c| c.channel != channel);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.enqueue(&unacked.queue, unacked.message);
            }
        }
    }
}

/// `*` matches one word and `#` zero or more words.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
        ExchangeKind::Direct | ExchangeKind::Custom(_) => binding_key == routing_key,
    }
}

/// Shared broker state. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Every message accepted by an exchange, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Nacked delivery tags with their requeue flag.
    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    /// Messages waiting in the queue for a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or_default()
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    /// Connections opened so far, closed ones included.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Fails the next `count` publishes with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Fails the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Drops every open connection as a network failure would: consumer
    /// streams end and unacknowledged deliveries are requeued.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        for conn in &state.connections {
            conn.store(false, Ordering::SeqCst);
        }
        state.connections.clear();

        let mut channels: Vec<u64> = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter().map(|c| c.channel))
            .chain(state.unacked.values().map(|u| u.channel))
            .collect();
        channels.sort_unstable();
        channels.dedup();
        for channel in channels {
            state.close_channel(channel);
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        cfg: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError(format!(
                "connection refused for '{}'",
                cfg.name
            )));
        }

        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(open.clone());
        state.connections_opened += 1;
        debug!(connection = cfg.name, "in-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            state: self.state.clone(),
            open,
        }))
    }
}

pub struct InMemoryConnection {
    state: Arc<Mutex<State>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let mut state = lock(&self.state);
        let id = state.next_channel;
        state.next_channel += 1;

        Ok(Arc::new(InMemoryChannel {
            id,
            state: self.state.clone(),
            open: AtomicBool::new(true),
            connection: self.open.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
    open: AtomicBool,
    connection: Arc<AtomicBool>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(lock(&self.state))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, exchange: &Exchange) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        match state.exchanges.get(&exchange.name) {
            Some(kind) if kind != &exchange.kind => Err(AmqpError::DeclareExchangeError(
                exchange.name.clone(),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.kind.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &Queue) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        state.queues.entry(queue.name().to_owned()).or_default();
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(BindingEntry {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open().map(|_| ())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(AmqpError::PublishingError("broker unavailable".to_owned()));
        }

        let message = PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties: properties.clone(),
        };
        state.route(message.clone())?;
        state.published.push(message);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.ensure_open()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (sender, mut receiver) = unbounded_channel();
        let pending = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.push(ConsumerSlot {
                    tag: consumer_tag.to_owned(),
                    channel: self.id,
                    sender,
                });
                std::mem::take(&mut q.pending)
            }
            None => VecDeque::new(),
        };
        for message in pending {
            state.enqueue(queue, message);
        }

        Ok(stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        if state.unacked.remove(&delivery_tag).is_none() {
            warn!(delivery_tag, "ack of an unknown delivery tag");
            return Err(AmqpError::AckMessageError);
        }
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.ensure_open()?;
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            warn!(delivery_tag, "nack of an unknown delivery tag");
            return Err(AmqpError::NackMessageError);
        };
        state.nacked.push((delivery_tag, requeue));
        if requeue {
            state.enqueue(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            lock(&self.state).close_channel(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::QueueKey;

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        broker
            .connect(&ConnectionConfig::new("esb"))
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap()
    }

    async fn declare(channel: &Arc<dyn BrokerChannel>, queue: &str) {
        let queue = Queue::new(QueueKey::new(queue).unwrap());
        channel.queue_declare(&queue).await.unwrap();
    }

    #[test]
    fn topic_patterns() {
        assert!(routes(&ExchangeKind::Topic, "invoices.*", "invoices.created"));
        assert!(!routes(&ExchangeKind::Topic, "invoices.*", "invoices.created.eu"));
        assert!(routes(&ExchangeKind::Topic, "invoices.#", "invoices"));
        assert!(routes(&ExchangeKind::Topic, "#.eu", "invoices.created.eu"));
        assert!(routes(&ExchangeKind::Topic, "#", "anything.at.all"));
        assert!(!routes(&ExchangeKind::Direct, "a", "b"));
        assert!(routes(&ExchangeKind::Fanout, "", "whatever"));
    }

    #[tokio::test]
    async fn pending_messages_reach_late_consumers() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&channel, "invoices").await;
        channel
            .queue_bind("invoices", AMQ_DIRECT, "invoices")
            .await
            .unwrap();

        channel
            .basic_publish(AMQ_DIRECT, "invoices", b"1", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.pending("invoices"), 1);

        let mut deliveries = channel.basic_consume("invoices", "invoices").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"1");
        assert_eq!(delivery.consumer_tag, "invoices");

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.acked(), vec![delivery.delivery_tag]);
        assert!(channel.basic_ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn requeued_nack_is_delivered_again() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&channel, "q").await;

        let mut deliveries = channel.basic_consume("q", "q").await.unwrap();
        channel
            .basic_publish("", "q", b"x", &MessageProperties::default())
            .await
            .unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        channel.basic_nack(first.delivery_tag, true).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_ne!(first.delivery_tag, second.delivery_tag);

        channel.basic_nack(second.delivery_tag, false).await.unwrap();
        assert_eq!(broker.unacked(), 0);
        assert_eq!(
            broker.nacked(),
            vec![(first.delivery_tag, true), (second.delivery_tag, false)]
        );
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_its_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let consuming = channel(&broker).await;
        declare(&consuming, "q").await;

        let mut deliveries = consuming.basic_consume("q", "q").await.unwrap();
        consuming
            .basic_publish("", "q", b"x", &MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        consuming.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.pending("q"), 1);
        assert!(!consuming.is_open());
    }

    #[tokio::test]
    async fn disconnecting_ends_consumer_streams() {
        let broker = InMemoryBroker::new();
        let consuming = channel(&broker).await;
        declare(&consuming, "q").await;

        let mut deliveries = consuming.basic_consume("q", "q").await.unwrap();
        consuming
            .basic_publish("", "q", b"x", &MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        broker.disconnect_all();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.pending("q"), 1);

        let reopened = channel(&broker).await;
        let mut deliveries = reopened.basic_consume("q", "q").await.unwrap();
        assert_eq!(deliveries.next().await.unwrap().unwrap().body, b"x");
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn unknown_exchange_rejects_publish_and_failures_are_injected() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        assert!(channel
            .basic_publish("missing", "", b"", &MessageProperties::default())
            .await
            .is_err());

        broker.fail_next_publishes(1);
        assert!(matches!(
            channel
                .basic_publish(AMQ_DIRECT, "", b"", &MessageProperties::default())
                .await,
            Err(AmqpError::PublishingError(_))
        ));
        assert!(channel
            .basic_publish(AMQ_DIRECT, "", b"", &MessageProperties::default())
            .await
            .is_ok());

        broker.disconnect_all();
        assert!(!channel.is_open());
    }
}
