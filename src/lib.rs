// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Typed publish/subscribe and request/response messaging over RabbitMQ.
//!
//! Events are published to the connection, exchange and routing key
//! resolved from the configured model, consumed by typed handlers, and
//! correlated with their caller when they answer an RPC request. Publishing
//! and handling run through configurable behavior pipelines (logging and
//! metrics are provided).
//!
//! Start from [`client::RabbitMqClientBuilder`] with a
//! [`config::RabbitMqConfig`] loaded from TOML or connections made with
//! [`builder::ConnectionBuilder`].

mod consumer;
mod otel;

pub mod amqp;
pub mod ask;
pub mod behaviors;
pub mod builder;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod handlers;
pub mod keys;
pub mod memory;
pub mod options;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod subscriber;
pub mod topology;
pub mod transport;
