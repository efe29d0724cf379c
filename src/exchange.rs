// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Exchanges declared once per connection during the model-build pass.
//! Exchanges are the routing mechanism in RabbitMQ that determine how
//! messages are distributed to queues.

use crate::errors::MessagingError;

/// Name of the pre-declared direct exchange every broker provides.
pub const AMQ_DIRECT: &str = "amq.direct";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Plugin provided exchange types, e.g. `x-delayed-message`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    /// Parses the configured type name, case-insensitive.
    pub fn parse(kind: &str) -> Result<Self, MessagingError> {
        match kind.trim().to_lowercase().as_str() {
            "" => Err(MessagingError::InvalidConfiguration(
                "exchange type must not be empty".to_owned(),
            )),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Ok(ExchangeKind::Custom(other.to_owned())),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
        }
    }
}

/// An exchange to declare, deduplicated by name within a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind) -> Result<Self, MessagingError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MessagingError::InvalidConfiguration(
                "exchange name must not be empty".to_owned(),
            ));
        }

        Ok(Exchange {
            name: name.to_owned(),
            kind,
            durable: true,
            auto_delete: false,
        })
    }

    /// Sets whether the exchange survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the exchange is deleted once no queue is bound to it.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_and_custom_kinds() {
        assert_eq!(ExchangeKind::parse("Direct").unwrap(), ExchangeKind::Direct);
        assert_eq!(ExchangeKind::parse("fanout").unwrap(), ExchangeKind::Fanout);
        assert_eq!(
            ExchangeKind::parse("x-delayed-message").unwrap(),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert!(ExchangeKind::parse(" ").is_err());
    }

    #[test]
    fn defaults_to_durable() {
        let exchange = Exchange::new("events", ExchangeKind::Topic).unwrap();
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);
        assert!(Exchange::new("", ExchangeKind::Topic).is_err());
    }
}
