// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Channels are created lazily and cached:
//!
//! - one publish channel per connection, shared by every publish,
//! - one subscribe channel per subscription, carrying its prefetch and used to
//!   ack/nack its deliveries.
//!
//! A cached channel found closed is replaced on next use. Channels are opened
//! outside any map lock; when two tasks race to open the same channel the
//! loser closes its own and uses the winner's.
//!
//! Consumers are tracked by consumer tag so that a delivery can be resolved
//! back to the connection and subscription it belongs to.

use crate::{
    connection::ConnectionFactory,
    errors::MessagingError,
    keys::{ConnectionKey, RoutingKey, SubscriptionKey},
    options::SubscriptionOptions,
    transport::{BrokerChannel, DeliveryStream},
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
struct ConsumerEntry {
    routing_key: RoutingKey,
    connection: ConnectionKey,
    subscription: SubscriptionKey,
}

pub struct ChannelFactory {
    connections: Arc<ConnectionFactory>,
    publish_channels: DashMap<ConnectionKey, Arc<dyn BrokerChannel>>,
    subscribe_channels: DashMap<(ConnectionKey, SubscriptionKey), Arc<dyn BrokerChannel>>,
    consumers: DashMap<String, Vec<ConsumerEntry>>,
    disposed: AtomicBool,
}

impl ChannelFactory {
    pub fn new(connections: Arc<ConnectionFactory>) -> Self {
        Self {
            connections,
            publish_channels: DashMap::default(),
            subscribe_channels: DashMap::default(),
            consumers: DashMap::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// The connections channels are opened on.
    pub fn connections(&self) -> &Arc<ConnectionFactory> {
        &self.connections
    }

    /// Opens a channel that is not cached, e.g. to declare the topology.
    pub async fn create_channel(
        &self,
        connection: &ConnectionKey,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        Ok(self.connections.get(connection)?.create_channel().await?)
    }

    /// The publish channel of the connection, shared by every publish and
    /// replaced once closed.
    ///
    /// # Parameters
    /// * `connection` - the configured connection to publish on
    ///
    /// # Returns
    /// The open channel, or the error of the connection or channel opening.
    pub async fn get_or_create_channel_for_publish(
        &self,
        connection: &ConnectionKey,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        if let Some(channel) = open_channel(&self.publish_channels, connection) {
            return Ok(channel);
        }

        let channel = self.create_channel(connection).await?;
        debug!(connection = connection.name(), "publish channel created");

        Ok(cache_channel(&self.publish_channels, connection.clone(), channel).await)
    }

    /// The channel of the subscription, created with its prefetch count.
    pub async fn get_or_create_channel_for_subscribe(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        let map_key = (connection.clone(), key.clone());
        if let Some(channel) = open_channel(&self.subscribe_channels, &map_key) {
            return Ok(channel);
        }

        let channel = self.create_channel(connection).await?;
        channel.basic_qos(options.prefetch_count).await?;
        debug!(
            connection = connection.name(),
            subscription = %key,
            prefetch_count = options.prefetch_count,
            "subscribe channel created"
        );

        Ok(cache_channel(&self.subscribe_channels, map_key, channel).await)
    }

    /// The subscribe channel, if it was created.
    pub fn subscribe_channel(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
    ) -> Option<Arc<dyn BrokerChannel>> {
        self.subscribe_channels
            .get(&(connection.clone(), key.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Forgets the subscribe channel so that the next subscribe opens a new
    /// one. The channel is closed when still open.
    pub async fn drop_subscribe_channel(&self, connection: &ConnectionKey, key: &SubscriptionKey) {
        let Some((_, channel)) = self
            .subscribe_channels
            .remove(&(connection.clone(), key.clone()))
        else {
            return;
        };

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                warn!(
                    error = err.to_string(),
                    connection = connection.name(),
                    subscription = %key,
                    "failure to close subscribe channel"
                );
            }
        }
    }

    /// Starts consuming the subscription's queue on its channel. The queue
    /// name is the consumer tag.
    ///
    /// Consuming the same subscription again replaces its consumer entry.
    pub async fn create_consumer(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
    ) -> Result<DeliveryStream, MessagingError> {
        let channel = self.subscribe_channel(connection, key).ok_or_else(|| {
            MessagingError::ChannelNotFound {
                connection: connection.clone(),
                key: key.clone(),
            }
        })?;

        let tag = key.queue.name();
        let stream = channel.basic_consume(tag, tag).await?;

        let mut entries = self.consumers.entry(tag.to_owned()).or_default();
        entries.retain(|e| e.connection != *connection || e.subscription != *key);
        entries.push(ConsumerEntry {
            routing_key: key.routing_key.clone(),
            connection: connection.clone(),
            subscription: key.clone(),
        });
        drop(entries);
        debug!(connection = connection.name(), consumer_tag = tag, "consumer created");

        Ok(stream)
    }

    /// Resolves a delivery to its connection and subscription.
    ///
    /// # Parameters
    /// * `consumer_tag` - the tag of the consumer, which is the queue name
    /// * `routing_key` - the routing key the delivery was published with
    ///
    /// The routing key of the delivery is matched first; when it matches none
    /// of the tag's subscriptions, a tag with a single subscription still
    /// resolves to it.
    pub fn try_get_subscription_keys(
        &self,
        consumer_tag: &str,
        routing_key: &str,
    ) -> Option<(ConnectionKey, SubscriptionKey)> {
        let entries = self.consumers.get(consumer_tag)?;

        let entry = entries
            .iter()
            .find(|e| e.routing_key.key() == routing_key)
            .or(match entries.as_slice() {
                [single] => Some(single),
                _ => None,
            })
            .map(|e| (e.connection.clone(), e.subscription.clone()));
        entry
    }

    /// Closes every cached channel. Later calls do nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut channels: Vec<Arc<dyn BrokerChannel>> = self
            .publish_channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        channels.extend(
            self.subscribe_channels
                .iter()
                .map(|entry| entry.value().clone()),
        );
        self.publish_channels.clear();
        self.subscribe_channels.clear();
        self.consumers.clear();

        for channel in channels.into_iter().filter(|c| c.is_open()) {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "failure to close channel");
            }
        }
    }
}

fn open_channel<K: Eq + Hash>(
    channels: &DashMap<K, Arc<dyn BrokerChannel>>,
    key: &K,
) -> Option<Arc<dyn BrokerChannel>> {
    channels
        .get(key)
        .map(|entry| entry.value().clone())
        .filter(|channel| channel.is_open())
}

async fn cache_channel<K: Eq + Hash>(
    channels: &DashMap<K, Arc<dyn BrokerChannel>>,
    key: K,
    channel: Arc<dyn BrokerChannel>,
) -> Arc<dyn BrokerChannel> {
    let winner = match channels.entry(key) {
        Entry::Occupied(mut occupied) if !occupied.get().is_open() => {
            occupied.insert(channel.clone());
            None
        }
        Entry::Occupied(occupied) => Some(occupied.get().clone()),
        Entry::Vacant(vacant) => {
            vacant.insert(channel.clone());
            None
        }
    };

    match winner {
        None => channel,
        Some(winner) => {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close duplicated channel");
            }
            winner
        }
    }
}
