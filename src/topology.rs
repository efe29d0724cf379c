// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Model Build
//!
//! Declares the exchanges, queues and bindings of every connection, then
//! starts a consumer for each subscription. Declarations run on short lived
//! channels that are closed once the connection's model is declared. A
//! connection that fails is logged and does not stop the other ones; the
//! first failure is returned once every connection was tried.
//!
//! Exchanges reserved by the broker (the default exchange and the `amq.`
//! ones) are never declared.

use crate::{
    channel::ChannelFactory,
    errors::MessagingError,
    keys::{ConnectionKey, SubscriptionKey},
    registry::OptionsRegistry,
    subscriber::EventsSubscriber,
    transport::BrokerChannel,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

const RESERVED_EXCHANGE_PREFIX: &str = "amq.";

pub struct Topology {
    registry: Arc<OptionsRegistry>,
    channels: Arc<ChannelFactory>,
    subscriber: Arc<EventsSubscriber>,
    built: AtomicBool,
}

impl Topology {
    pub fn new(
        registry: Arc<OptionsRegistry>,
        channels: Arc<ChannelFactory>,
        subscriber: Arc<EventsSubscriber>,
    ) -> Self {
        Self {
            registry,
            channels,
            subscriber,
            built: AtomicBool::new(false),
        }
    }

    /// Declares the model and subscribes. Once it succeeded, later calls do
    /// nothing; after a failure the next call builds again.
    pub async fn build(&self) -> Result<(), MessagingError> {
        if self.built.swap(true, Ordering::SeqCst) {
            debug!("model already built");
            return Ok(());
        }

        let result = self.build_all().await;
        if result.is_err() {
            self.built.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn build_all(&self) -> Result<(), MessagingError> {
        let connections: Vec<ConnectionKey> = self.registry.connection_keys().cloned().collect();

        let mut first_error = None;
        for connection in &connections {
            if let Err(err) = self.build_connection(connection).await {
                error!(
                    error = err.to_string(),
                    connection = connection.name(),
                    "failure to build the model"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(connections = connections.len(), "model built");
                Ok(())
            }
        }
    }

    async fn build_connection(&self, connection: &ConnectionKey) -> Result<(), MessagingError> {
        self.declare(connection).await?;
        self.subscribe_all(connection).await
    }

    async fn declare(&self, connection: &ConnectionKey) -> Result<(), MessagingError> {
        let channel = self.channels.create_channel(connection).await?;
        let result = self.declare_on(&channel, connection).await;

        if let Err(err) = channel.close().await {
            warn!(
                error = err.to_string(),
                connection = connection.name(),
                "failure to close the declaration channel"
            );
        }

        result
    }

    async fn declare_on(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        connection: &ConnectionKey,
    ) -> Result<(), MessagingError> {
        for exchange in self.registry.exchanges_for_declare(connection)? {
            if exchange.name.starts_with(RESERVED_EXCHANGE_PREFIX) {
                debug!(exchange = exchange.name, "reserved exchange, not declared");
                continue;
            }

            channel.exchange_declare(exchange).await?;
            debug!(
                connection = connection.name(),
                exchange = exchange.name,
                "exchange declared"
            );
        }

        for queue in self.registry.queues_for_declare(connection)? {
            channel.queue_declare(queue).await?;
            debug!(connection = connection.name(), queue = queue.name(), "queue declared");

            for binding in &queue.bindings {
                channel
                    .queue_bind(queue.name(), &binding.exchange, binding.routing_key.key())
                    .await?;
                debug!(
                    queue = queue.name(),
                    exchange = binding.exchange,
                    routing_key = binding.routing_key.key(),
                    "queue bound"
                );
            }
        }

        Ok(())
    }

    async fn subscribe_all(&self, connection: &ConnectionKey) -> Result<(), MessagingError> {
        let subscriptions: Vec<(SubscriptionKey, bool)> = self
            .registry
            .subscriptions(connection)?
            .map(|(key, options)| (key.clone(), options.need_consume))
            .collect();

        for (key, need_consume) in subscriptions {
            if !need_consume {
                warn!(
                    connection = connection.name(),
                    subscription = %key,
                    "consumption disabled, subscription skipped"
                );
                continue;
            }

            self.subscriber.subscribe(connection, &key).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ask::AskManager,
        codec::CodecRegistry,
        config::{ConnectionConfig, ExchangeConfig, QueueConfig, RabbitMqConfig, SubscriptionConfig},
        connection::ConnectionFactory,
        context::ScopeStore,
        dispatcher::EventsHandlerService,
        handler::Event,
        handlers::HandlerRegistry,
        memory::InMemoryBroker,
        pipeline::BehaviorRegistry,
        transport::{Connector, MessageProperties},
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct InvoiceIssued {
        number: String,
    }

    impl Event for InvoiceIssued {}

    fn topology(broker: &InMemoryBroker, cfg: &RabbitMqConfig) -> (Topology, Arc<ChannelFactory>) {
        let connector: Arc<dyn Connector> = Arc::new(broker.clone());
        let registry = Arc::new(OptionsRegistry::from_config(cfg).unwrap());
        let channels = Arc::new(ChannelFactory::new(Arc::new(
            ConnectionFactory::new(connector, &cfg.connections).unwrap(),
        )));
        let service = Arc::new(EventsHandlerService::new(
            Arc::new(CodecRegistry::new()),
            Arc::new(AskManager::new()),
        ));
        let mut handlers = HandlerRegistry::new();
        handlers.register_event::<InvoiceIssued>();

        let subscriber = Arc::new(EventsSubscriber::new(
            registry.clone(),
            channels.clone(),
            handlers,
            service,
            Arc::new(ScopeStore::new()),
            BehaviorRegistry::new(),
        ));

        (Topology::new(registry, channels.clone(), subscriber), channels)
    }

    fn config() -> RabbitMqConfig {
        let mut conn = ConnectionConfig::new("esb");
        conn.model
            .exchanges
            .push(ExchangeConfig::new("billing", "topic"));
        conn.model
            .exchanges
            .push(ExchangeConfig::new("amq.direct", "direct"));
        conn.model.queues.push(
            QueueConfig::new("invoices")
                .bind("billing", "invoices.*")
                .bind("amq.direct", "invoices"),
        );
        conn.model.queues.push(QueueConfig::new("archive").bind("billing", "#"));
        conn.model.subscriptions.push(
            SubscriptionConfig::new("invoices", "invoices.issued", InvoiceIssued::type_name())
                .handler(false),
        );
        conn.model.subscriptions.push(
            SubscriptionConfig::new("archive", "#", InvoiceIssued::type_name())
                .handler(false)
                .need_consume(false),
        );
        RabbitMqConfig {
            connections: vec![conn],
        }
    }

    #[tokio::test]
    async fn declares_the_model_and_subscribes() {
        let broker = InMemoryBroker::new();
        let (topology, channels) = topology(&broker, &config());

        topology.build().await.unwrap();

        assert!(broker.has_exchange("billing"));
        assert!(broker.has_queue("invoices"));
        assert!(broker.has_queue("archive"));
        assert!(broker.is_bound("invoices", "billing", "invoices.*"));
        assert!(broker.is_bound("invoices", "amq.direct", "invoices"));
        assert!(broker.is_bound("archive", "billing", "#"));

        let connection = ConnectionKey::new("esb").unwrap();
        assert!(channels
            .try_get_subscription_keys("invoices", "invoices.issued")
            .is_some());
        assert!(channels
            .try_get_subscription_keys("archive", "invoices.issued")
            .is_none());
        assert!(channels.subscribe_channel(&connection, &invoices()).is_some());

        let publish = channels.create_channel(&connection).await.unwrap();
        publish
            .basic_publish(
                "billing",
                "invoices.issued",
                br#"{"number":"A-1"}"#,
                &MessageProperties::default(),
            )
            .await
            .unwrap();
        assert_eq!(broker.pending("archive"), 1);
    }

    #[tokio::test]
    async fn builds_once() {
        let broker = InMemoryBroker::new();
        let (topology, _) = topology(&broker, &config());

        topology.build().await.unwrap();
        topology.build().await.unwrap();

        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_can_be_retried() {
        let broker = InMemoryBroker::new();
        let mut cfg = config();
        cfg.connections[0].connect_retry_count = 0;
        let (topology, _) = topology(&broker, &cfg);

        broker.fail_next_connects(1);
        assert!(matches!(
            topology.build().await,
            Err(MessagingError::Transport(_))
        ));

        topology.build().await.unwrap();
        assert!(broker.has_queue("invoices"));
    }

    fn invoices() -> SubscriptionKey {
        SubscriptionKey::new(
            crate::keys::QueueKey::new("invoices").unwrap(),
            crate::keys::RoutingKey::new("invoices.issued"),
        )
    }
}
