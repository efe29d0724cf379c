// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Identity Keys
//!
//! Value types used as map keys by every other component. Keys are immutable
//! and normalized once at construction:
//!
//! - connection and event keys are trimmed and lower-cased,
//! - queue names and routing keys are trimmed and get their placeholders
//!   (`{host_name}`, `{app_name}`, `{app_instance}`) substituted.

use crate::errors::MessagingError;
use std::{env, fmt, sync::OnceLock};
use uuid::Uuid;

pub const HOST_NAME_PLACEHOLDER: &str = "{host_name}";
pub const APP_NAME_PLACEHOLDER: &str = "{app_name}";
pub const APP_INSTANCE_PLACEHOLDER: &str = "{app_instance}";

/// Values substituted into queue names and routing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub host_name: String,
    pub app_name: String,
    pub app_instance: String,
}

impl Placeholders {
    /// Process-wide placeholders read from the environment once.
    ///
    /// `HOST_NAME` falls back to `HOSTNAME` then `localhost`, `APP_NAME` falls
    /// back to the crate name and `APP_INSTANCE` to a random id generated for
    /// this process.
    pub fn from_env() -> &'static Placeholders {
        static PLACEHOLDERS: OnceLock<Placeholders> = OnceLock::new();
        PLACEHOLDERS.get_or_init(|| Placeholders {
            host_name: non_empty_var("HOST_NAME")
                .or_else(|| non_empty_var("HOSTNAME"))
                .unwrap_or_else(|| "localhost".to_owned()),
            app_name: non_empty_var("APP_NAME")
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned()),
            app_instance: non_empty_var("APP_INSTANCE")
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        })
    }

    /// Single left-to-right pass: substituted values are never re-scanned.
    fn apply(&self, value: &str) -> String {
        let tokens = [
            (HOST_NAME_PLACEHOLDER, self.host_name.as_str()),
            (APP_NAME_PLACEHOLDER, self.app_name.as_str()),
            (APP_INSTANCE_PLACEHOLDER, self.app_instance.as_str()),
        ];

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            match tokens.iter().find(|(token, _)| tail.starts_with(token)) {
                Some((token, replacement)) => {
                    out.push_str(replacement);
                    rest = &tail[token.len()..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(value: &str, what: &str) -> Result<String, MessagingError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MessagingError::InvalidConfiguration(format!(
            "{} must not be empty",
            what
        )));
    }
    Ok(trimmed.to_owned())
}

/// Identifies one broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(name: &str) -> Result<Self, MessagingError> {
        Ok(Self(required(name, "connection name")?.to_lowercase()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

/// Identifies one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(name: &str) -> Result<Self, MessagingError> {
        Self::with_placeholders(name, Placeholders::from_env())
    }

    pub fn with_placeholders(
        name: &str,
        placeholders: &Placeholders,
    ) -> Result<Self, MessagingError> {
        let name = required(name, "queue name")?;
        Ok(Self(placeholders.apply(&name)))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

/// Routing key. May be empty, e.g. for fanout exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: &str) -> Self {
        Self::with_placeholders(key, Placeholders::from_env())
    }

    pub fn with_placeholders(key: &str, placeholders: &Placeholders) -> Self {
        Self(placeholders.apply(key.trim()))
    }

    /// Key taken verbatim, e.g. a reply-to address received from the broker.
    pub fn raw(key: &str) -> Self {
        Self(key.to_owned())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

/// Identifies an event schema by its type name, case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey(String);

impl EventKey {
    pub fn new(type_name: &str) -> Result<Self, MessagingError> {
        Ok(Self(required(type_name, "event type name")?.to_lowercase()))
    }

    /// Key of a typed event.
    pub fn of<E: crate::handler::Event>() -> Self {
        Self(E::type_name().trim().to_lowercase())
    }

    pub fn type_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

/// Identifies one inbound subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub queue: QueueKey,
    pub routing_key: RoutingKey,
}

impl SubscriptionKey {
    pub fn new(queue: QueueKey, routing_key: RoutingKey) -> Self {
        Self { queue, routing_key }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ queue: {}, routing_key: {} }}",
            self.queue, self.routing_key
        )
    }
}

/// Identifies one outbound publish target.
///
/// The routing key is optional: RPC response options and exchange-only
/// targets are registered without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublishKey {
    pub exchange: String,
    pub event: EventKey,
    pub routing_key: Option<RoutingKey>,
}

impl PublishKey {
    pub fn new(
        exchange: &str,
        event: EventKey,
        routing_key: Option<RoutingKey>,
    ) -> Result<Self, MessagingError> {
        Ok(Self {
            exchange: required(exchange, "exchange name")?,
            event,
            routing_key,
        })
    }

    /// The same target without its routing key.
    pub fn without_routing_key(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            event: self.event.clone(),
            routing_key: None,
        }
    }

    pub fn routing_key_str(&self) -> &str {
        self.routing_key.as_ref().map(|k| k.key()).unwrap_or_default()
    }
}

impl fmt::Display for PublishKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ exchange: '{}', event: {}, routing_key: '{}' }}",
            self.exchange,
            self.event,
            self.routing_key_str()
        )
    }
}
