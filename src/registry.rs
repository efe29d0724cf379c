// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Options Registry
//!
//! Single source of truth mapping identity keys to the declared topology and
//! the resolved per-event options of every connection.
//!
//! The registry is built once at startup, either from a validated
//! [`RabbitMqConfig`] or by hand with [`ConnectionOptions`], and is read-only
//! afterwards so it can be shared behind an `Arc` without locking.
//!
//! Publish target resolution is strict: when no explicit value is given at
//! call time an event must map to exactly one connection, and inside it to
//! exactly one exchange and one routing key. Zero or several candidates is a
//! resolution error listing the candidates, never a silent pick.

use crate::{
    config::{ConnectionConfig, ModelConfig, RabbitMqConfig},
    errors::MessagingError,
    exchange::{Exchange, ExchangeKind},
    keys::{ConnectionKey, EventKey, PublishKey, QueueKey, RoutingKey, SubscriptionKey},
    options::{PublishOptions, RpcRequestOptions, SubscriptionOptions},
    queue::Queue,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};
use tracing::debug;

/// Topology and options of one connection, checked for duplicates while added.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    connection: ConnectionKey,
    queues: Vec<Queue>,
    exchanges: Vec<Exchange>,
    subscriptions: BTreeMap<SubscriptionKey, SubscriptionOptions>,
    publish: HashMap<PublishKey, PublishOptions>,
    rpc_requests: HashMap<PublishKey, RpcRequestOptions>,
}

impl ConnectionOptions {
    /// Empty options of the connection.
    pub fn new(connection: ConnectionKey) -> Self {
        Self {
            connection,
            queues: vec![],
            exchanges: vec![],
            subscriptions: BTreeMap::default(),
            publish: HashMap::default(),
            rpc_requests: HashMap::default(),
        }
    }

    pub fn connection(&self) -> &ConnectionKey {
        &self.connection
    }

    /// Adds a queue to declare.
    ///
    /// # Returns
    /// `DuplicateQueue` when a queue of the same name was already added.
    pub fn add_queue(&mut self, queue: Queue) -> Result<(), MessagingError> {
        if self.queues.iter().any(|q| q.key == queue.key) {
            return Err(MessagingError::DuplicateQueue {
                connection: self.connection.clone(),
                queue: queue.key,
            });
        }

        self.queues.push(queue);
        Ok(())
    }

    /// Exchanges are deduplicated by name, the first declaration wins.
    pub fn add_exchange(&mut self, exchange: Exchange) {
        if self.exchanges.iter().any(|e| e.name == exchange.name) {
            debug!(
                connection = self.connection.name(),
                exchange = exchange.name,
                "exchange declared more than once, keeping the first declaration"
            );
            return;
        }

        self.exchanges.push(exchange);
    }

    /// Adds the options of one subscription.
    ///
    /// # Parameters
    /// * `key` - the queue and routing key consumed
    /// * `options` - event, flags and behaviors of the subscription
    ///
    /// # Returns
    /// `DuplicateSubscription` when the key is already taken.
    ///
    /// # Example
    /// ```
    /// use rabbitmq_client::{
    ///     errors::MessagingError,
    ///     keys::{ConnectionKey, EventKey, QueueKey, RoutingKey, SubscriptionKey},
    ///     options::SubscriptionOptions,
    ///     registry::ConnectionOptions,
    /// };
    ///
    /// # fn main() -> Result<(), MessagingError> {
    /// let mut options = ConnectionOptions::new(ConnectionKey::new("esb")?);
    /// let key = SubscriptionKey::new(QueueKey::new("orders")?, RoutingKey::new("orders"));
    /// let event = SubscriptionOptions::new(EventKey::new("OrderPlaced")?);
    ///
    /// options.add_subscription(key.clone(), event.clone())?;
    /// assert!(matches!(
    ///     options.add_subscription(key, event),
    ///     Err(MessagingError::DuplicateSubscription { .. })
    /// ));
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_subscription(
        &mut self,
        key: SubscriptionKey,
        options: SubscriptionOptions,
    ) -> Result<(), MessagingError> {
        if self.subscriptions.contains_key(&key) {
            return Err(MessagingError::DuplicateSubscription {
                connection: self.connection.clone(),
                key,
            });
        }

        self.subscriptions.insert(key, options);
        Ok(())
    }

    /// Adds the options used to publish one event to one exchange.
    pub fn add_publish(
        &mut self,
        key: PublishKey,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        if self.publish.contains_key(&key) {
            return Err(MessagingError::DuplicatePublishOptions {
                connection: self.connection.clone(),
                key,
            });
        }

        self.publish.insert(key, options);
        Ok(())
    }

    /// Adds the options used to send one RPC request and await its response.
    pub fn add_rpc_request(
        &mut self,
        key: PublishKey,
        options: RpcRequestOptions,
    ) -> Result<(), MessagingError> {
        if self.rpc_requests.contains_key(&key) {
            return Err(MessagingError::DuplicateRpcRequestOptions {
                connection: self.connection.clone(),
                key,
            });
        }

        self.rpc_requests.insert(key, options);
        Ok(())
    }

    /// Builds the options of a connection from its validated configuration.
    pub fn from_config(cfg: &ConnectionConfig) -> Result<Self, MessagingError> {
        let mut options = ConnectionOptions::new(ConnectionKey::new(&cfg.name)?);
        options.add_model(&cfg.model)?;
        Ok(options)
    }

    fn add_model(&mut self, model: &ModelConfig) -> Result<(), MessagingError> {
        for q in &model.queues {
            let mut queue = Queue::new(QueueKey::new(&q.name)?)
                .durable(q.durable)
                .exclusive(q.exclusive)
                .auto_delete(q.auto_delete);
            for binding in &q.bindings {
                queue = queue.bind(&binding.exchange, RoutingKey::new(&binding.routing_key));
            }
            self.add_queue(queue)?;
        }

        for e in &model.exchanges {
            let exchange = Exchange::new(&e.name, ExchangeKind::parse(&e.kind)?)?
                .durable(e.durable)
                .auto_delete(e.auto_delete);
            self.add_exchange(exchange);
        }

        for s in &model.subscriptions {
            let key = SubscriptionKey::new(QueueKey::new(&s.queue)?, RoutingKey::new(&s.routing_key));
            let options = SubscriptionOptions {
                event: EventKey::new(&s.event)?,
                response: s
                    .response_event
                    .as_deref()
                    .map(EventKey::new)
                    .transpose()?,
                handler_enabled: s.handler,
                content_type: s.content_type.trim().to_owned(),
                prefetch_count: s.prefetch_count,
                correlation_enabled: s.correlation,
                behaviors: s.behaviors.clone(),
                need_consume: s.need_consume,
            };
            self.add_subscription(key, options)?;
        }

        for p in &model.publish {
            let key = PublishKey::new(
                &p.exchange,
                EventKey::new(&p.event)?,
                p.routing_key.as_deref().map(RoutingKey::new),
            )?;
            let options = PublishOptions {
                content_type: p.content_type.trim().to_owned(),
                retry_count: p.retry_count,
                delivery_mode: p.delivery_mode,
                behaviors: p.behaviors.clone(),
            };
            self.add_publish(key, options)?;
        }

        for r in &model.rpc_requests {
            let key = PublishKey::new(
                &r.exchange,
                EventKey::new(&r.event)?,
                r.routing_key.as_deref().map(RoutingKey::new),
            )?;
            let options = RpcRequestOptions {
                publish: PublishOptions {
                    content_type: r.content_type.trim().to_owned(),
                    retry_count: r.retry_count,
                    delivery_mode: r.delivery_mode,
                    behaviors: r.behaviors.clone(),
                },
                reply_to: RoutingKey::new(&r.reply_to),
                timeout: Duration::from_secs(r.timeout_secs),
            };
            self.add_rpc_request(key, options)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    options: ConnectionOptions,
    exchanges_by_event: HashMap<EventKey, BTreeSet<String>>,
    routing_keys_by_event: HashMap<EventKey, BTreeSet<RoutingKey>>,
}

impl ConnectionEntry {
    fn new(options: ConnectionOptions) -> Self {
        let mut exchanges_by_event: HashMap<EventKey, BTreeSet<String>> = HashMap::default();
        let mut routing_keys_by_event: HashMap<EventKey, BTreeSet<RoutingKey>> =
            HashMap::default();

        for key in options.publish.keys().chain(options.rpc_requests.keys()) {
            exchanges_by_event
                .entry(key.event.clone())
                .or_default()
                .insert(key.exchange.clone());

            if let Some(routing_key) = &key.routing_key {
                routing_keys_by_event
                    .entry(key.event.clone())
                    .or_default()
                    .insert(routing_key.clone());
            }
        }

        Self {
            options,
            exchanges_by_event,
            routing_keys_by_event,
        }
    }
}

/// Read-only lookup of topology and options by key.
#[derive(Debug, Default)]
pub struct OptionsRegistry {
    connections: BTreeMap<ConnectionKey, ConnectionEntry>,
    publish_connections_by_event: HashMap<EventKey, BTreeSet<ConnectionKey>>,
}

impl OptionsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from a configuration, validating it first.
    pub fn from_config(cfg: &RabbitMqConfig) -> Result<Self, MessagingError> {
        cfg.validate()?;

        let mut registry = OptionsRegistry::new();
        for conn in &cfg.connections {
            registry.add_connection_options(ConnectionOptions::from_config(conn)?)?;
        }

        Ok(registry)
    }

    /// Registers the options of a connection and records which events it can
    /// publish.
    pub fn add_connection_options(
        &mut self,
        options: ConnectionOptions,
    ) -> Result<(), MessagingError> {
        let connection = options.connection.clone();
        if self.connections.contains_key(&connection) {
            return Err(MessagingError::DuplicateConnection(connection));
        }

        for key in options.publish.keys().chain(options.rpc_requests.keys()) {
            self.publish_connections_by_event
                .entry(key.event.clone())
                .or_default()
                .insert(connection.clone());
        }

        debug!(
            connection = connection.name(),
            queues = options.queues.len(),
            exchanges = options.exchanges.len(),
            subscriptions = options.subscriptions.len(),
            "connection options registered"
        );

        self.connections
            .insert(connection, ConnectionEntry::new(options));
        Ok(())
    }

    /// Keys of every registered connection, in order.
    pub fn connection_keys(&self) -> impl Iterator<Item = &ConnectionKey> {
        self.connections.keys()
    }

    fn entry(&self, connection: &ConnectionKey) -> Result<&ConnectionEntry, MessagingError> {
        self.connections
            .get(connection)
            .ok_or_else(|| MessagingError::ConnectionNotFound(connection.clone()))
    }

    /// Queues to declare on the connection, in registration order.
    pub fn queues_for_declare(&self, connection: &ConnectionKey) -> Result<&[Queue], MessagingError> {
        Ok(&self.entry(connection)?.options.queues)
    }

    /// Exchanges to declare on the connection, deduplicated by name.
    pub fn exchanges_for_declare(
        &self,
        connection: &ConnectionKey,
    ) -> Result<&[Exchange], MessagingError> {
        Ok(&self.entry(connection)?.options.exchanges)
    }

    /// Every subscription of the connection, ordered by key.
    pub fn subscriptions(
        &self,
        connection: &ConnectionKey,
    ) -> Result<impl Iterator<Item = (&SubscriptionKey, &SubscriptionOptions)>, MessagingError>
    {
        Ok(self.entry(connection)?.options.subscriptions.iter())
    }

    /// # Returns
    /// The options of the subscription, or `SubscriptionNotFound`.
    pub fn subscription_options(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
    ) -> Result<&SubscriptionOptions, MessagingError> {
        self.entry(connection)?
            .options
            .subscriptions
            .get(key)
            .ok_or_else(|| MessagingError::SubscriptionNotFound {
                connection: connection.clone(),
                key: key.clone(),
            })
    }

    /// Resolves the connection an event is published from.
    ///
    /// An explicit connection name is used as is.
    pub fn connection_key_for_publish_event(
        &self,
        event: &EventKey,
        explicit: Option<&str>,
    ) -> Result<ConnectionKey, MessagingError> {
        if let Some(name) = explicit.filter(|n| !n.trim().is_empty()) {
            return ConnectionKey::new(name);
        }

        let candidates: Vec<&ConnectionKey> = self
            .publish_connections_by_event
            .get(event)
            .map(|set| set.iter().collect())
            .unwrap_or_default();

        match candidates.as_slice() {
            [single] => Ok((*single).clone()),
            _ => Err(MessagingError::AmbiguousOrMissingConnection {
                event: event.clone(),
                candidates: candidates.iter().map(|c| c.name().to_owned()).collect(),
            }),
        }
    }

    /// Resolves the only exchange the event is published to on the
    /// connection.
    ///
    /// # Returns
    /// `AmbiguousOrMissingExchange` with the candidates when there is not
    /// exactly one.
    pub fn exchange_for_publish_event(
        &self,
        connection: &ConnectionKey,
        event: &EventKey,
    ) -> Result<String, MessagingError> {
        let entry = self.entry(connection)?;
        let candidates: Vec<String> = entry
            .exchanges_by_event
            .get(event)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        match candidates.as_slice() {
            [single] => Ok(single.clone()),
            _ => Err(MessagingError::AmbiguousOrMissingExchange {
                connection: connection.clone(),
                event: event.clone(),
                candidates,
            }),
        }
    }

    /// Resolves the only routing key the event is published with on the
    /// connection.
    ///
    /// # Returns
    /// `AmbiguousOrMissingRoutingKey` with the candidates when there is not
    /// exactly one.
    pub fn routing_key_for_publish_event(
        &self,
        connection: &ConnectionKey,
        event: &EventKey,
    ) -> Result<RoutingKey, MessagingError> {
        let entry = self.entry(connection)?;
        let candidates: Vec<&RoutingKey> = entry
            .routing_keys_by_event
            .get(event)
            .map(|set| set.iter().collect())
            .unwrap_or_default();

        match candidates.as_slice() {
            [single] => Ok((*single).clone()),
            _ => Err(MessagingError::AmbiguousOrMissingRoutingKey {
                connection: connection.clone(),
                event: event.clone(),
                candidates: candidates.iter().map(|k| k.key().to_owned()).collect(),
            }),
        }
    }

    /// Publish options of an event, exchange and routing key.
    pub fn publish_options(
        &self,
        connection: &ConnectionKey,
        key: &PublishKey,
    ) -> Result<&PublishOptions, MessagingError> {
        self.entry(connection)?
            .options
            .publish
            .get(key)
            .ok_or_else(|| MessagingError::OptionsNotFound {
                connection: connection.clone(),
                key: key.clone(),
            })
    }

    /// RPC request options of an event, exchange and routing key.
    pub fn rpc_request_options(
        &self,
        connection: &ConnectionKey,
        key: &PublishKey,
    ) -> Result<&RpcRequestOptions, MessagingError> {
        self.entry(connection)?
            .options
            .rpc_requests
            .get(key)
            .ok_or_else(|| MessagingError::OptionsNotFound {
                connection: connection.clone(),
                key: key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PublishConfig, QueueConfig, SubscriptionConfig};

    fn conn(name: &str) -> ConnectionKey {
        ConnectionKey::new(name).unwrap()
    }

    fn event(name: &str) -> EventKey {
        EventKey::new(name).unwrap()
    }

    fn publish_key(exchange: &str, ev: &str, rk: Option<&str>) -> PublishKey {
        PublishKey::new(exchange, event(ev), rk.map(RoutingKey::new)).unwrap()
    }

    #[test]
    fn resolves_single_connection_exchange_and_routing_key() {
        let mut options = ConnectionOptions::new(conn("esb"));
        options
            .add_publish(publish_key("billing", "Invoice", Some("invoices")), PublishOptions::default())
            .unwrap();

        let mut registry = OptionsRegistry::new();
        registry.add_connection_options(options).unwrap();

        let ev = event("invoice");
        let connection = registry.connection_key_for_publish_event(&ev, None).unwrap();
        assert_eq!(connection, conn("ESB"));
        assert_eq!(
            registry.exchange_for_publish_event(&connection, &ev).unwrap(),
            "billing"
        );
        assert_eq!(
            registry
                .routing_key_for_publish_event(&connection, &ev)
                .unwrap()
                .key(),
            "invoices"
        );
        assert!(registry
            .publish_options(&connection, &publish_key("billing", "Invoice", Some("invoices")))
            .is_ok());
    }

    #[test]
    fn event_published_from_two_connections_is_ambiguous() {
        let mut registry = OptionsRegistry::new();
        for name in ["a", "b"] {
            let mut options = ConnectionOptions::new(conn(name));
            options
                .add_publish(publish_key("x", "Invoice", Some("rk")), PublishOptions::default())
                .unwrap();
            registry.add_connection_options(options).unwrap();
        }

        let err = registry
            .connection_key_for_publish_event(&event("Invoice"), None)
            .unwrap_err();
        match err {
            MessagingError::AmbiguousOrMissingConnection { candidates, .. } => {
                assert_eq!(candidates, vec!["a".to_owned(), "b".to_owned()])
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert_eq!(
            registry
                .connection_key_for_publish_event(&event("Invoice"), Some("B"))
                .unwrap(),
            conn("b")
        );
    }

    #[test]
    fn unknown_event_is_missing_connection() {
        let registry = OptionsRegistry::new();
        assert!(matches!(
            registry.connection_key_for_publish_event(&event("nope"), None),
            Err(MessagingError::AmbiguousOrMissingConnection { .. })
        ));
    }

    #[test]
    fn several_exchanges_or_routing_keys_are_ambiguous() {
        let mut options = ConnectionOptions::new(conn("esb"));
        options
            .add_publish(publish_key("x1", "Invoice", Some("a")), PublishOptions::default())
            .unwrap();
        options
            .add_publish(publish_key("x2", "Invoice", Some("b")), PublishOptions::default())
            .unwrap();
        let mut registry = OptionsRegistry::new();
        registry.add_connection_options(options).unwrap();

        let connection = conn("esb");
        assert!(matches!(
            registry.exchange_for_publish_event(&connection, &event("Invoice")),
            Err(MessagingError::AmbiguousOrMissingExchange { candidates, .. }) if candidates.len() == 2
        ));
        assert!(matches!(
            registry.routing_key_for_publish_event(&connection, &event("Invoice")),
            Err(MessagingError::AmbiguousOrMissingRoutingKey { candidates, .. }) if candidates.len() == 2
        ));
    }

    #[test]
    fn rejects_duplicate_connection() {
        let mut registry = OptionsRegistry::new();
        registry
            .add_connection_options(ConnectionOptions::new(conn("esb")))
            .unwrap();
        assert!(matches!(
            registry.add_connection_options(ConnectionOptions::new(conn("ESB"))),
            Err(MessagingError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn duplicate_publish_options_name_the_colliding_key() {
        let mut cfg = ConnectionConfig::new("esb");
        cfg.model.publish = vec![
            PublishConfig::new("billing", "Invoice", Some("rk")),
            PublishConfig::new("billing", "invoice", Some("rk")),
        ];

        let err = ConnectionOptions::from_config(&cfg).unwrap_err();
        match &err {
            MessagingError::DuplicatePublishOptions { key, .. } => {
                assert_eq!(key, &publish_key("billing", "invoice", Some("rk")))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let mut cfg = ConnectionConfig::new("esb");
        cfg.model.subscriptions = vec![
            SubscriptionConfig::new("q", "rk", "A"),
            SubscriptionConfig::new(" q ", "rk", "B"),
        ];
        assert!(matches!(
            ConnectionOptions::from_config(&cfg),
            Err(MessagingError::DuplicateSubscription { .. })
        ));

        cfg.model.subscriptions = vec![
            SubscriptionConfig::new("q", "rk1", "A"),
            SubscriptionConfig::new("q", "rk2", "A"),
        ];
        assert!(ConnectionOptions::from_config(&cfg).is_ok());
    }

    #[test]
    fn lookups_on_unknown_keys_fail() {
        let mut cfg = RabbitMqConfig::default();
        let mut conn_cfg = ConnectionConfig::new("esb");
        conn_cfg.model.queues = vec![QueueConfig::new("q").bind("amq.direct", "q")];
        cfg.connections.push(conn_cfg);
        let registry = OptionsRegistry::from_config(&cfg).unwrap();

        let connection = conn("esb");
        assert_eq!(registry.queues_for_declare(&connection).unwrap().len(), 1);
        assert!(matches!(
            registry.queues_for_declare(&conn("other")),
            Err(MessagingError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            registry.subscription_options(
                &connection,
                &SubscriptionKey::new(QueueKey::new("q").unwrap(), RoutingKey::new("q"))
            ),
            Err(MessagingError::SubscriptionNotFound { .. })
        ));
        assert!(matches!(
            registry.rpc_request_options(&connection, &publish_key("x", "E", None)),
            Err(MessagingError::OptionsNotFound { .. })
        ));
    }
}
