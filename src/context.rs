// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Contexts
//!
//! Per-message state handed to behaviors and handlers. Contexts are passed
//! explicitly down the call chain and dropped once the message is handled.

use crate::{
    keys::{ConnectionKey, PublishKey, SubscriptionKey},
    transport::{InboundDelivery, MessageProperties},
};
use dashmap::DashMap;
use opentelemetry::Context;
use serde_json::Value;

/// One outbound message on its way through the publish pipeline.
#[derive(Debug, Clone)]
pub struct PublishMessageContext {
    pub connection: ConnectionKey,
    /// Resolved target: exchange, event and routing key.
    pub target: PublishKey,
    /// Type name of the published event.
    pub event_type: &'static str,
    /// The event, not yet encoded.
    pub content: Value,
    /// Properties set by the publish variant, completed when sent.
    pub properties: MessageProperties,
    /// Trace context injected into the message headers.
    pub otel: Context,
}

impl PublishMessageContext {
    pub fn exchange(&self) -> &str {
        &self.target.exchange
    }

    pub fn routing_key(&self) -> &str {
        self.target.routing_key_str()
    }
}

/// One inbound delivery on its way through the handle pipeline.
#[derive(Debug, Clone)]
pub struct SubscribeMessageContext {
    pub connection: ConnectionKey,
    pub subscription: SubscriptionKey,
    pub delivery: InboundDelivery,
    /// Trace context of the consumer span.
    pub otel: Context,
}

impl SubscribeMessageContext {
    pub fn correlation_id(&self) -> Option<&str> {
        self.delivery.properties.correlation_id()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.delivery.properties.reply_to()
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }
}

/// Trace contexts of pending RPC calls by correlation id.
///
/// The caller's context is saved when a request is published and restored as
/// the parent of the span that handles the matching response.
#[derive(Debug, Default)]
pub struct ScopeStore {
    scopes: DashMap<String, Context>,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, correlation_id: &str, cx: Context) {
        if correlation_id.is_empty() {
            return;
        }
        self.scopes.insert(correlation_id.to_owned(), cx);
    }

    /// Removes and returns the saved context. An empty id never has one.
    pub fn take(&self, correlation_id: &str) -> Option<Context> {
        if correlation_id.is_empty() {
            return None;
        }
        self.scopes.remove(correlation_id).map(|(_, cx)| cx)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_restored_once() {
        let store = ScopeStore::new();
        store.save("abc", Context::new());
        store.save("", Context::new());
        assert_eq!(store.len(), 1);

        assert!(store.take("").is_none());
        assert!(store.take("abc").is_some());
        assert!(store.take("abc").is_none());
        assert!(store.is_empty());
    }
}
