// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Three error families are used across the crate:
//!
//! - [`AmqpError`]: failures reported by the broker primitive (connect, declare,
//!   publish, consume, ack/nack). These are the transient ones the publisher
//!   retries.
//! - [`MessagingError`]: configuration, resolution, serialization and dispatch
//!   failures raised by the client itself, plus wrapped transport errors.
//! - [`AskError`]: the failure side of an RPC call. `ask` never panics or
//!   throws for these, it returns them as the `Err` arm of its result.

use crate::keys::{ConnectionKey, EventKey, PublishKey, QueueKey, SubscriptionKey};
use std::time::Duration;
use thiserror::Error;

/// Error type returned by user event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every variant carries the message of the underlying client error so that
/// it survives being logged far away from where it was raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors raised by the messaging client.
///
/// Configuration errors are fatal at startup, resolution errors are raised
/// synchronously at call time and never retried, transport errors are only
/// visible once the retry policy gave up.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Required configuration fields are missing or malformed
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration could not be read or parsed
    #[error("failure to load configuration: {0}")]
    ConfigurationLoad(String),

    /// Options for the connection were already registered
    #[error("options for connection {0} already exist")]
    DuplicateConnection(ConnectionKey),

    /// The same queue was configured twice within one connection
    #[error("queue {queue} is configured twice in connection {connection}")]
    DuplicateQueue {
        connection: ConnectionKey,
        queue: QueueKey,
    },

    /// The same subscription key was configured twice within one connection
    #[error("subscription {key} is configured twice in connection {connection}")]
    DuplicateSubscription {
        connection: ConnectionKey,
        key: SubscriptionKey,
    },

    /// The same publish key was configured twice within one connection
    #[error("publish options {key} are configured twice in connection {connection}")]
    DuplicatePublishOptions {
        connection: ConnectionKey,
        key: PublishKey,
    },

    /// The same RPC request key was configured twice within one connection
    #[error("rpc request options {key} are configured twice in connection {connection}")]
    DuplicateRpcRequestOptions {
        connection: ConnectionKey,
        key: PublishKey,
    },

    /// No options or broker connection registered under the key
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionKey),

    /// No subscription options registered under the key
    #[error("subscription {key} not found in connection {connection}")]
    SubscriptionNotFound {
        connection: ConnectionKey,
        key: SubscriptionKey,
    },

    /// No publish or RPC request options registered under the key
    #[error("options {key} not found in connection {connection}")]
    OptionsNotFound {
        connection: ConnectionKey,
        key: PublishKey,
    },

    /// The event is publishable from zero or several connections
    #[error("unable to resolve connection for event {event}, candidates: {candidates:?}; pass the connection name explicitly")]
    AmbiguousOrMissingConnection {
        event: EventKey,
        candidates: Vec<String>,
    },

    /// The event maps to zero or several exchanges within the connection
    #[error("unable to resolve exchange for event {event} in connection {connection}, candidates: {candidates:?}; pass the exchange explicitly")]
    AmbiguousOrMissingExchange {
        connection: ConnectionKey,
        event: EventKey,
        candidates: Vec<String>,
    },

    /// The event maps to zero or several routing keys within the connection
    #[error("unable to resolve routing key for event {event} in connection {connection}, candidates: {candidates:?}; pass the routing key explicitly")]
    AmbiguousOrMissingRoutingKey {
        connection: ConnectionKey,
        event: EventKey,
        candidates: Vec<String>,
    },

    /// A consumer was requested before its channel was created
    #[error("channel for subscription {key} not found in connection {connection}")]
    ChannelNotFound {
        connection: ConnectionKey,
        key: SubscriptionKey,
    },

    /// No codec is registered for the content type
    #[error("codec for content type `{0}` not found")]
    CodecNotFound(String),

    /// The event could not be encoded
    #[error("failure to serialize message: {0}")]
    Serialization(String),

    /// The payload could not be decoded into the expected event
    #[error("failure to deserialize message: {0}")]
    Deserialization(String),

    /// An RPC response was requested for a delivery without reply-to
    #[error("reply-to is missing in the inbound message properties")]
    MissingReplyTo,

    /// A correlated operation was requested for a delivery without correlation id
    #[error("correlation id is missing in the inbound message properties")]
    MissingCorrelationId,

    /// No handler is registered for the subscription
    #[error("handler for subscription {0} not found")]
    HandlerNotFound(SubscriptionKey),

    /// A subscription names a handler but none was registered for the event
    #[error("handler for event {0} is configured but not registered")]
    HandlerNotRegistered(EventKey),

    /// A subscription references an event type unknown to the handler registry
    #[error("event {0} is not registered")]
    EventNotRegistered(EventKey),

    /// An RPC request handler ran before a publisher was attached to answer it
    #[error("no publisher attached to answer rpc request {0}")]
    PublisherNotAttached(EventKey),

    /// Bookkeeping failure in the RPC correlation manager
    #[error("invalid ask attempt: {0}")]
    InvalidAskAttempt(String),

    /// The user handler failed
    #[error("handler failure: {0}")]
    Handler(#[source] HandlerError),

    /// Transport level failure
    #[error(transparent)]
    Transport(#[from] AmqpError),
}

/// Failure outcome of an RPC call.
#[derive(Error, Debug)]
pub enum AskError {
    /// The correlation slot was missing or already resolved
    #[error("invalid ask attempt: {0}")]
    InvalidAskAttempt(String),

    /// No response arrived in time
    #[error("no response received within {0:?}")]
    Timeout(Duration),

    /// The call was cancelled before the request was published
    #[error("ask was cancelled")]
    Cancelled,

    /// A response arrived but it is not of the awaited type
    #[error("unexpected response type, expected `{expected}`")]
    UnexpectedResponseType { expected: &'static str },

    /// Resolution, serialization or publish failure
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}
