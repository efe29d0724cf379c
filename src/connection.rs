// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! One lazily opened connection per configured connection key. A connection
//! found closed is reopened on next use, with the connection retry policy
//! (`connect_retry_count` attempts after the first, waiting
//! `connect_backoff_base^n` seconds).

use crate::{
    config::ConnectionConfig,
    errors::{AmqpError, MessagingError},
    keys::ConnectionKey,
    retry::RetryPolicy,
    transport::{BrokerChannel, BrokerConnection, Connector},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A connection reopened on demand.
pub struct RabbitMqConnection {
    key: ConnectionKey,
    cfg: ConnectionConfig,
    connector: Arc<dyn Connector>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl RabbitMqConnection {
    /// A connection that opens nothing until first used.
    ///
    /// # Parameters
    /// * `key` - identity of the connection
    /// * `cfg` - endpoint, credentials and retry settings
    /// * `connector` - opens the broker connection
    pub fn new(key: ConnectionKey, cfg: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            key,
            cfg,
            connector,
            current: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// The retry policy of connection attempts, also used to recover
    /// consumers of this connection.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.cfg.connect_retry_count, self.cfg.connect_backoff_base)
    }

    /// The live connection, opened when absent or closed.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref().filter(|c| c.is_connected()) {
            return Ok(conn.clone());
        }

        debug!(connection = self.key.name(), host = self.cfg.host, "connecting...");
        let conn = self
            .retry_policy()
            .execute(
                || self.connector.connect(&self.cfg),
                |_| true,
                |err, wait, attempt| {
                    warn!(
                        error = err.to_string(),
                        connection = self.key.name(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "failure to connect, retrying"
                    )
                },
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    connection = self.key.name(),
                    "failure to connect"
                )
            })?;
        debug!(connection = self.key.name(), "connected");

        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Opens a channel, reconnecting first when needed.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.connection().await?.create_channel().await
    }

    /// Closes the connection if open. The next use reopens it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.current.lock().await.take();
        match conn {
            Some(conn) if conn.is_connected() => conn.close().await,
            _ => Ok(()),
        }
    }
}

/// The connections of every configured connection key.
pub struct ConnectionFactory {
    connections: BTreeMap<ConnectionKey, Arc<RabbitMqConnection>>,
}

impl ConnectionFactory {
    /// One connection per configuration.
    ///
    /// # Returns
    /// `DuplicateConnection` when two configurations share a name.
    pub fn new(
        connector: Arc<dyn Connector>,
        configs: &[ConnectionConfig],
    ) -> Result<Self, MessagingError> {
        let mut connections = BTreeMap::new();
        for cfg in configs {
            let key = ConnectionKey::new(&cfg.name)?;
            if connections.contains_key(&key) {
                return Err(MessagingError::DuplicateConnection(key));
            }
            let conn = RabbitMqConnection::new(key.clone(), cfg.clone(), connector.clone());
            connections.insert(key, Arc::new(conn));
        }

        Ok(Self { connections })
    }

    /// The connection of the key, or `ConnectionNotFound`.
    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<RabbitMqConnection>, MessagingError> {
        self.connections
            .get(key)
            .cloned()
            .ok_or_else(|| MessagingError::ConnectionNotFound(key.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConnectionKey> {
        self.connections.keys()
    }

    /// Closes every open connection, logging the failures.
    pub async fn close_all(&self) {
        for (key, conn) in &self.connections {
            if let Err(err) = conn.close().await {
                error!(
                    error = err.to_string(),
                    connection = key.name(),
                    "failure to close connection"
                );
            }
        }
    }
}
