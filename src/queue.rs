// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Queues declared once per connection during the model-build pass, together
//! with the bindings that route exchange traffic into them.

use crate::keys::{QueueKey, RoutingKey};

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: RoutingKey,
}

/// Definition of a queue with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub key: QueueKey,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub bindings: Vec<Binding>,
}

impl Queue {
    /// Creates a durable, non-exclusive queue without bindings.
    pub fn new(key: QueueKey) -> Queue {
        Queue {
            key,
            durable: true,
            exclusive: false,
            auto_delete: false,
            bindings: vec![],
        }
    }

    /// Sets whether the queue survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Exclusive queues are bound to the declaring connection.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Sets whether the queue is deleted once its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Adds a binding from `exchange` with `routing_key`.
    pub fn bind(mut self, exchange: &str, routing_key: RoutingKey) -> Self {
        self.bindings.push(Binding {
            exchange: exchange.to_owned(),
            routing_key,
        });
        self
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }
}
