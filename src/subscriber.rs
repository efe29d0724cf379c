// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events Subscriber
//!
//! Starts one consumer per configured subscription and feeds its deliveries
//! to the events handler service. Deliveries of one consumer are handled
//! concurrently, bounded by the prefetch count of the subscription.
//!
//! A consumer whose stream ends before the subscriber stops is recovered:
//! its channel is dropped and the consumer reopened with the retry policy of
//! its connection, every [`RECOVERY_INTERVAL`] until it succeeds.

use crate::{
    channel::ChannelFactory,
    consumer::DeliveryConsumer,
    context::{ScopeStore, SubscribeMessageContext},
    dispatcher::{EventsHandlerService, Registration},
    errors::MessagingError,
    handlers::HandlerRegistry,
    keys::{ConnectionKey, SubscriptionKey},
    options::SubscriptionOptions,
    pipeline::{BehaviorRegistry, Pipeline},
    registry::OptionsRegistry,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Pause between two failed rounds of consumer recovery.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(5);

pub struct EventsSubscriber {
    registry: Arc<OptionsRegistry>,
    channels: Arc<ChannelFactory>,
    handlers: HandlerRegistry,
    service: Arc<EventsHandlerService>,
    behaviors: BehaviorRegistry<SubscribeMessageContext, MessagingError>,
    consumer: Arc<DeliveryConsumer>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl EventsSubscriber {
    /// Creates a subscriber consuming the subscriptions of `registry` with
    /// the handlers of `handlers`.
    ///
    /// # Parameters
    /// * `service` - receives every delivery once consumed
    /// * `scopes` - trace scopes of the RPC calls in flight
    /// * `behaviors` - named behaviors the subscription pipelines pick from
    pub fn new(
        registry: Arc<OptionsRegistry>,
        channels: Arc<ChannelFactory>,
        handlers: HandlerRegistry,
        service: Arc<EventsHandlerService>,
        scopes: Arc<ScopeStore>,
        behaviors: BehaviorRegistry<SubscribeMessageContext, MessagingError>,
    ) -> Self {
        let consumer = Arc::new(DeliveryConsumer::new(
            channels.clone(),
            service.clone(),
            scopes,
        ));

        Self {
            registry,
            channels,
            handlers,
            service,
            behaviors,
            consumer,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Starts consuming the subscription.
    ///
    /// Subscribing twice to the same subscription does nothing the second
    /// time.
    ///
    /// # Errors
    /// Fails when the subscription is not configured, its event has no
    /// registration, or the consumer cannot be opened. The subscription can
    /// be subscribed again after a failure.
    pub async fn subscribe(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
    ) -> Result<(), MessagingError> {
        let options = self.registry.subscription_options(connection, key)?;
        let handler = self
            .handlers
            .get(&options.event)
            .ok_or_else(|| MessagingError::EventNotRegistered(options.event.clone()))?;

        let registration = Registration {
            options: options.clone(),
            handler,
            pipeline: Pipeline::compose(&options.behaviors, &self.behaviors),
        };
        if !self.service.try_register(connection, key, registration) {
            warn!(
                connection = connection.name(),
                subscription = %key,
                "handler already registered, skipping subscription"
            );
            return Ok(());
        }

        let stream = match open_consumer(&self.channels, connection, key, options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.service.unregister(connection, key);
                error!(
                    error = err.to_string(),
                    connection = connection.name(),
                    subscription = %key,
                    "failure to subscribe"
                );
                return Err(err);
            }
        };

        self.spawn_consumer(connection, key, options.clone(), stream);
        info!(
            connection = connection.name(),
            subscription = %key,
            event = options.event.type_name(),
            "subscribed"
        );

        Ok(())
    }

    /// Stops every consumer loop, recovering ones included, and waits for the
    /// deliveries in flight.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn spawn_consumer(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
        options: SubscriptionOptions,
        mut stream: DeliveryStream,
    ) {
        let shutdown = self.shutdown.clone();
        let tasks = self.tasks.clone();
        let consumer = self.consumer.clone();
        let channels = self.channels.clone();
        let connection = connection.clone();
        let key = key.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => {
                            let consumer = consumer.clone();
                            tasks.spawn(async move { consumer.consume(delivery).await });
                        }
                        Some(Err(err)) => error!(
                            error = err.to_string(),
                            connection = connection.name(),
                            subscription = %key,
                            "failure to receive message"
                        ),
                        None => {
                            warn!(
                                connection = connection.name(),
                                subscription = %key,
                                "consumer stream ended, recovering"
                            );
                            match recover(&channels, &connection, &key, &options, &shutdown).await {
                                Some(recovered) => stream = recovered,
                                None => break,
                            }
                        }
                    },
                }
            }
            debug!(connection = connection.name(), subscription = %key, "consumer stopped");
        });
    }
}

async fn open_consumer(
    channels: &ChannelFactory,
    connection: &ConnectionKey,
    key: &SubscriptionKey,
    options: &SubscriptionOptions,
) -> Result<DeliveryStream, MessagingError> {
    channels
        .get_or_create_channel_for_subscribe(connection, key, options)
        .await?;
    channels.create_consumer(connection, key).await
}

/// Reopens the consumer of a subscription whose stream ended. Returns `None`
/// once the subscriber stops.
async fn recover(
    channels: &ChannelFactory,
    connection: &ConnectionKey,
    key: &SubscriptionKey,
    options: &SubscriptionOptions,
    shutdown: &CancellationToken,
) -> Option<DeliveryStream> {
    let policy = match channels.connections().get(connection) {
        Ok(conn) => conn.retry_policy(),
        Err(err) => {
            error!(error = err.to_string(), subscription = %key, "failure to recover consumer");
            return None;
        }
    };
    channels.drop_subscribe_channel(connection, key).await;

    loop {
        let attempt = policy.execute(
            || open_consumer(channels, connection, key, options),
            |err| matches!(err, MessagingError::Transport(_)),
            |err, wait, attempt| {
                warn!(
                    error = err.to_string(),
                    connection = connection.name(),
                    subscription = %key,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "failure to recover consumer, retrying"
                )
            },
        );

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = attempt => match result {
                Ok(stream) => {
                    info!(connection = connection.name(), subscription = %key, "consumer recovered");
                    return Some(stream);
                }
                Err(err) => error!(
                    error = err.to_string(),
                    connection = connection.name(),
                    subscription = %key,
                    "failure to recover consumer"
                ),
            },
        }

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = sleep(RECOVERY_INTERVAL) => {}
        }
    }
}
