// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resolved Options
//!
//! Per-target options as stored in the [`OptionsRegistry`](crate::registry::OptionsRegistry)
//! after configuration was validated, plus the call-time overrides accepted by
//! the publisher.

use crate::keys::{EventKey, RoutingKey};
use std::time::Duration;

/// Content type of the built-in JSON codec.
pub const DEFAULT_CONTENT_TYPE: &str = "Json";
pub const DEFAULT_PREFETCH_COUNT: u16 = 5;
pub const DEFAULT_RETRY_COUNT: u32 = 5;
/// AMQP delivery mode 2: persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// How inbound messages of one subscription are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub event: EventKey,
    /// Type of the RPC response this request is answered with, informational.
    pub response: Option<EventKey>,
    /// Whether the registered user handler runs for this subscription.
    pub handler_enabled: bool,
    pub content_type: String,
    pub prefetch_count: u16,
    /// Completes pending RPC calls by correlation id.
    pub correlation_enabled: bool,
    /// Names of the handle behaviors, outermost first.
    pub behaviors: Vec<String>,
    /// Disabled subscriptions are skipped by the model-build pass.
    pub need_consume: bool,
}

impl SubscriptionOptions {
    pub fn new(event: EventKey) -> Self {
        Self {
            event,
            response: None,
            handler_enabled: true,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            correlation_enabled: false,
            behaviors: vec![],
            need_consume: true,
        }
    }
}

/// How events are published to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: String,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub delivery_mode: u8,
    /// Names of the publish behaviors, outermost first.
    pub behaviors: Vec<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            retry_count: DEFAULT_RETRY_COUNT,
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            behaviors: vec![],
        }
    }
}

/// Publish options of an RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequestOptions {
    pub publish: PublishOptions,
    /// Routing key the responder publishes the answer to.
    pub reply_to: RoutingKey,
    pub timeout: Duration,
}

impl RpcRequestOptions {
    pub fn new(reply_to: RoutingKey) -> Self {
        Self {
            publish: PublishOptions::default(),
            reply_to,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Call-time overrides of the registry-resolved publish target.
///
/// Every supplied value replaces the resolved one; the others are still
/// resolved from the event type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishParams {
    pub connection: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
}

impl PublishParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, name: &str) -> Self {
        self.connection = Some(name.to_owned());
        self
    }

    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = Some(name.to_owned());
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }
}
