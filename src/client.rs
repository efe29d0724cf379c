// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Wires the options registry, the connection and channel factories, the
//! publisher and the subscriber from one configuration. `start` declares the
//! model and starts the consumers, `shutdown` stops them and closes channels
//! and connections.
//!
//! ```no_run
//! use rabbitmq_client::{builder::ConnectionBuilder, client::RabbitMqClientBuilder, config::RabbitMqConfig};
//!
//! # async fn run() -> Result<(), rabbitmq_client::errors::MessagingError> {
//! let client = RabbitMqClientBuilder::new(RabbitMqConfig::default())
//!     .connection(ConnectionBuilder::new("esb").host("rabbitmq").build())
//!     .build()?;
//! client.start().await?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::LapinConnector,
    ask::AskManager,
    behaviors::{default_handle_behaviors, default_publish_behaviors},
    channel::ChannelFactory,
    codec::{CodecRegistry, MessageCodec},
    config::{ConnectionConfig, RabbitMqConfig},
    connection::ConnectionFactory,
    context::{PublishMessageContext, ScopeStore, SubscribeMessageContext},
    dispatcher::EventsHandlerService,
    errors::MessagingError,
    handlers::HandlerRegistry,
    pipeline::{Behavior, BehaviorRegistry},
    publisher::EventsPublisher,
    registry::OptionsRegistry,
    subscriber::EventsSubscriber,
    topology::Topology,
    transport::Connector,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info};

pub struct RabbitMqClientBuilder {
    config: RabbitMqConfig,
    connector: Option<Arc<dyn Connector>>,
    handlers: HandlerRegistry,
    codecs: CodecRegistry,
    publish_behaviors: BehaviorRegistry<PublishMessageContext, MessagingError>,
    handle_behaviors: BehaviorRegistry<SubscribeMessageContext, MessagingError>,
}

impl RabbitMqClientBuilder {
    pub fn new(config: RabbitMqConfig) -> Self {
        Self {
            config,
            connector: None,
            handlers: HandlerRegistry::new(),
            codecs: CodecRegistry::new(),
            publish_behaviors: default_publish_behaviors(),
            handle_behaviors: default_handle_behaviors(),
        }
    }

    /// Adds a connection, e.g. one made with
    /// [`ConnectionBuilder`](crate::builder::ConnectionBuilder).
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connections.push(connection);
        self
    }

    /// Replaces the lapin connector, e.g. with an in-memory broker.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codecs.register(codec);
        self
    }

    pub fn publish_behavior(
        mut self,
        behavior: Arc<dyn Behavior<PublishMessageContext, MessagingError>>,
    ) -> Self {
        self.publish_behaviors.register(behavior);
        self
    }

    pub fn handle_behavior(
        mut self,
        behavior: Arc<dyn Behavior<SubscribeMessageContext, MessagingError>>,
    ) -> Self {
        self.handle_behaviors.register(behavior);
        self
    }

    /// Validates the configuration and wires the client. Nothing is opened
    /// until the client is started or used.
    pub fn build(self) -> Result<RabbitMqClient, MessagingError> {
        let registry = Arc::new(OptionsRegistry::from_config(&self.config)?);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(LapinConnector));
        let connections = Arc::new(ConnectionFactory::new(connector, &self.config.connections)?);
        let channels = Arc::new(ChannelFactory::new(connections));

        let codecs = Arc::new(self.codecs);
        let asks = Arc::new(AskManager::new());
        let scopes = Arc::new(ScopeStore::new());
        let service = Arc::new(EventsHandlerService::new(codecs.clone(), asks.clone()));

        let publisher = Arc::new(EventsPublisher::new(
            registry.clone(),
            channels.clone(),
            codecs,
            asks,
            scopes.clone(),
            self.publish_behaviors,
        ));
        self.handlers.attach_publisher(publisher.clone());
        let subscriber = Arc::new(EventsSubscriber::new(
            registry.clone(),
            channels.clone(),
            self.handlers,
            service,
            scopes,
            self.handle_behaviors,
        ));
        let topology = Topology::new(registry, channels.clone(), subscriber.clone());

        debug!(
            connections = self.config.connections.len(),
            "rabbitmq client configured"
        );

        Ok(RabbitMqClient {
            publisher,
            subscriber,
            topology,
            channels,
            closed: AtomicBool::new(false),
        })
    }
}

pub struct RabbitMqClient {
    publisher: Arc<EventsPublisher>,
    subscriber: Arc<EventsSubscriber>,
    topology: Topology,
    channels: Arc<ChannelFactory>,
    closed: AtomicBool,
}

impl RabbitMqClient {
    pub fn publisher(&self) -> &Arc<EventsPublisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<EventsSubscriber> {
        &self.subscriber
    }

    /// Declares the model of every connection and starts the consumers.
    pub async fn start(&self) -> Result<(), MessagingError> {
        self.topology.build().await
    }

    /// Stops the consumers, then closes channels and connections. Later calls
    /// do nothing.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.subscriber.stop().await;
        self.channels.dispose().await;
        self.channels.connections().close_all().await;
        info!("rabbitmq client stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PublishConfig, QueueConfig, SubscriptionConfig},
        context::SubscribeMessageContext,
        errors::HandlerError,
        handler::{Event, EventHandler},
        memory::InMemoryBroker,
    };
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct UserCreated {
        login: String,
    }

    impl Event for UserCreated {}

    struct Forward(UnboundedSender<UserCreated>);

    #[async_trait]
    impl EventHandler<UserCreated> for Forward {
        async fn handle(
            &self,
            _ctx: &SubscribeMessageContext,
            event: UserCreated,
        ) -> Result<(), HandlerError> {
            self.0.send(event)?;
            Ok(())
        }
    }

    fn connection() -> ConnectionConfig {
        let mut conn = ConnectionConfig::new("esb");
        conn.model
            .queues
            .push(QueueConfig::new("users").bind("amq.direct", "users.created"));
        conn.model.subscriptions.push(
            SubscriptionConfig::new("users", "users.created", UserCreated::type_name())
                .behavior("logging"),
        );
        conn.model.publish.push(
            PublishConfig::new("amq.direct", UserCreated::type_name(), Some("users.created"))
                .behavior("logging")
                .behavior("metrics"),
        );
        conn
    }

    #[tokio::test]
    async fn published_events_reach_their_handler() {
        let broker = InMemoryBroker::new();
        let (sender, mut receiver) = unbounded_channel();
        let mut handlers = HandlerRegistry::new();
        handlers.register_handler::<UserCreated, _>(Forward(sender));

        let client = RabbitMqClientBuilder::new(RabbitMqConfig::default())
            .connection(connection())
            .connector(Arc::new(broker.clone()))
            .handlers(handlers)
            .build()
            .unwrap();
        client.start().await.unwrap();

        client
            .publisher()
            .publish(&UserCreated {
                login: "ivan".to_owned(),
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(
            received,
            Some(UserCreated {
                login: "ivan".to_owned()
            })
        );

        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn xml_events_reach_their_handler() {
        let broker = InMemoryBroker::new();
        let (sender, mut receiver) = unbounded_channel();
        let mut handlers = HandlerRegistry::new();
        handlers.register_handler::<UserCreated, _>(Forward(sender));

        let mut conn = ConnectionConfig::new("esb");
        conn.model
            .queues
            .push(QueueConfig::new("users").bind("amq.direct", "users.created"));
        conn.model.subscriptions.push(
            SubscriptionConfig::new("users", "users.created", UserCreated::type_name())
                .content_type("Xml"),
        );
        conn.model.publish.push(
            PublishConfig::new("amq.direct", UserCreated::type_name(), Some("users.created"))
                .content_type("Xml"),
        );

        let client = RabbitMqClientBuilder::new(RabbitMqConfig::default())
            .connection(conn)
            .connector(Arc::new(broker.clone()))
            .handlers(handlers)
            .build()
            .unwrap();
        client.start().await.unwrap();

        client
            .publisher()
            .publish(&UserCreated {
                login: "0042".to_owned(),
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(
            received,
            Some(UserCreated {
                login: "0042".to_owned()
            })
        );

        let published = broker.published();
        assert_eq!(
            published[0].properties.content_type.as_deref(),
            Some("application/xml")
        );
        let body = String::from_utf8_lossy(&published[0].body);
        assert!(body.starts_with("<Message>"));
        assert!(body.contains("<login>0042</login>"));

        client.shutdown().await;
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let result = RabbitMqClientBuilder::new(RabbitMqConfig::default())
            .connection(ConnectionConfig::new(" "))
            .build();

        assert!(matches!(
            result,
            Err(MessagingError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn subscription_without_registered_event_fails_to_start() {
        let client = RabbitMqClientBuilder::new(RabbitMqConfig::default())
            .connection(connection())
            .connector(Arc::new(InMemoryBroker::new()))
            .build()
            .unwrap();

        assert!(matches!(
            client.start().await,
            Err(MessagingError::EventNotRegistered(_))
        ));
    }
}
