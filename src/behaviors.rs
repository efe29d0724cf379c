// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Built-in Behaviors
//!
//! Logging and metrics behaviors for both pipelines, attached by the names
//! [`LOGGING_BEHAVIOR`] and [`METRICS_BEHAVIOR`].
//!
//! Message content is only rendered when the `TRACE` level is enabled.

use crate::{
    context::{PublishMessageContext, SubscribeMessageContext},
    errors::MessagingError,
    pipeline::{Behavior, BehaviorRegistry, Next, LOGGING_BEHAVIOR, METRICS_BEHAVIOR},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, trace, Level};

const METER_NAME: &str = "rabbitmq-client";

pub type PublishBehavior = dyn Behavior<PublishMessageContext, MessagingError>;
pub type HandleBehavior = dyn Behavior<SubscribeMessageContext, MessagingError>;

/// Publish side behaviors available by default.
pub fn default_publish_behaviors() -> BehaviorRegistry<PublishMessageContext, MessagingError> {
    let mut registry = BehaviorRegistry::new();
    registry
        .register(Arc::new(LoggingPublishBehavior))
        .register(Arc::new(MetricsPublishBehavior::new()));
    registry
}

/// Handle side behaviors available by default.
pub fn default_handle_behaviors() -> BehaviorRegistry<SubscribeMessageContext, MessagingError> {
    let mut registry = BehaviorRegistry::new();
    registry
        .register(Arc::new(LoggingHandleBehavior))
        .register(Arc::new(MetricsHandleBehavior::new()));
    registry
}

/// Logs every publish with its outcome and elapsed time.
pub struct LoggingPublishBehavior;

#[async_trait]
impl Behavior<PublishMessageContext, MessagingError> for LoggingPublishBehavior {
    fn name(&self) -> &str {
        LOGGING_BEHAVIOR
    }

    async fn handle(
        &self,
        ctx: &PublishMessageContext,
        next: Next<'_, PublishMessageContext, MessagingError>,
    ) -> Result<(), MessagingError> {
        let started = Instant::now();
        debug!(
            connection = ctx.connection.name(),
            exchange = ctx.exchange(),
            routing_key = ctx.routing_key(),
            event = ctx.event_type,
            "publishing message"
        );
        if tracing::enabled!(Level::TRACE) {
            trace!(content = ctx.content.to_string(), "message content");
        }

        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(
                exchange = ctx.exchange(),
                routing_key = ctx.routing_key(),
                elapsed_ms,
                "message published"
            ),
            Err(err) => error!(
                error = err.to_string(),
                exchange = ctx.exchange(),
                routing_key = ctx.routing_key(),
                elapsed_ms,
                "failure to publish message"
            ),
        }

        result
    }
}

/// Logs every handled delivery with its outcome and elapsed time.
pub struct LoggingHandleBehavior;

#[async_trait]
impl Behavior<SubscribeMessageContext, MessagingError> for LoggingHandleBehavior {
    fn name(&self) -> &str {
        LOGGING_BEHAVIOR
    }

    async fn handle(
        &self,
        ctx: &SubscribeMessageContext,
        next: Next<'_, SubscribeMessageContext, MessagingError>,
    ) -> Result<(), MessagingError> {
        let started = Instant::now();
        debug!(
            connection = ctx.connection.name(),
            queue = ctx.subscription.queue.name(),
            routing_key = ctx.delivery.routing_key,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "handling message"
        );
        if tracing::enabled!(Level::TRACE) {
            trace!(
                content = String::from_utf8_lossy(ctx.body()).as_ref(),
                "message content"
            );
        }

        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(
                queue = ctx.subscription.queue.name(),
                elapsed_ms,
                "message handled"
            ),
            Err(err) => error!(
                error = err.to_string(),
                queue = ctx.subscription.queue.name(),
                routing_key = ctx.delivery.routing_key,
                elapsed_ms,
                "failure to handle message"
            ),
        }

        result
    }
}

struct Instruments {
    attempts: Counter<u64>,
    successes: Counter<u64>,
    failures: Counter<u64>,
    duration: Histogram<f64>,
}

impl Instruments {
    fn new(direction: &str) -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            attempts: meter
                .u64_counter(format!("rabbitmq.{}.attempts", direction))
                .with_description("messages attempted")
                .build(),
            successes: meter
                .u64_counter(format!("rabbitmq.{}.successes", direction))
                .with_description("messages processed successfully")
                .build(),
            failures: meter
                .u64_counter(format!("rabbitmq.{}.failures", direction))
                .with_description("messages failed")
                .build(),
            duration: meter
                .f64_histogram(format!("rabbitmq.{}.duration", direction))
                .with_unit("ms")
                .with_description("processing duration")
                .build(),
        }
    }

    async fn measure<F>(&self, attributes: &[KeyValue], run: F) -> Result<(), MessagingError>
    where
        F: std::future::Future<Output = Result<(), MessagingError>>,
    {
        self.attempts.add(1, attributes);
        let started = Instant::now();

        let result = run.await;

        self.duration
            .record(started.elapsed().as_secs_f64() * 1000.0, attributes);
        match &result {
            Ok(()) => self.successes.add(1, attributes),
            Err(_) => self.failures.add(1, attributes),
        }

        result
    }
}

/// Counts outgoing messages and times their publication.
pub struct MetricsPublishBehavior {
    instruments: Instruments,
}

impl MetricsPublishBehavior {
    pub fn new() -> Self {
        Self {
            instruments: Instruments::new("publish"),
        }
    }
}

impl Default for MetricsPublishBehavior {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Behavior<PublishMessageContext, MessagingError> for MetricsPublishBehavior {
    fn name(&self) -> &str {
        METRICS_BEHAVIOR
    }

    async fn handle(
        &self,
        ctx: &PublishMessageContext,
        next: Next<'_, PublishMessageContext, MessagingError>,
    ) -> Result<(), MessagingError> {
        let attributes = [
            KeyValue::new("connection", ctx.connection.name().to_owned()),
            KeyValue::new("exchange", ctx.exchange().to_owned()),
            KeyValue::new("routing_key", ctx.routing_key().to_owned()),
        ];
        self.instruments.measure(&attributes, next.run()).await
    }
}

/// Counts inbound messages and times their handling.
pub struct MetricsHandleBehavior {
    instruments: Instruments,
}

impl MetricsHandleBehavior {
    pub fn new() -> Self {
        Self {
            instruments: Instruments::new("handle"),
        }
    }
}

impl Default for MetricsHandleBehavior {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Behavior<SubscribeMessageContext, MessagingError> for MetricsHandleBehavior {
    fn name(&self) -> &str {
        METRICS_BEHAVIOR
    }

    async fn handle(
        &self,
        ctx: &SubscribeMessageContext,
        next: Next<'_, SubscribeMessageContext, MessagingError>,
    ) -> Result<(), MessagingError> {
        let attributes = [
            KeyValue::new("connection", ctx.connection.name().to_owned()),
            KeyValue::new("queue", ctx.subscription.queue.name().to_owned()),
            KeyValue::new("routing_key", ctx.delivery.routing_key.clone()),
        ];
        self.instruments.measure(&attributes, next.run()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::{ConnectionKey, EventKey, PublishKey, RoutingKey},
        pipeline::Pipeline,
        transport::MessageProperties,
    };
    use opentelemetry::Context;

    fn publish_ctx() -> PublishMessageContext {
        PublishMessageContext {
            connection: ConnectionKey::new("esb").unwrap(),
            target: PublishKey::new(
                "amq.direct",
                EventKey::new("Invoice").unwrap(),
                Some(RoutingKey::new("invoices")),
            )
            .unwrap(),
            event_type: "Invoice",
            content: serde_json::json!({ "id": 1 }),
            properties: MessageProperties::default(),
            otel: Context::new(),
        }
    }

    #[tokio::test]
    async fn default_behaviors_pass_results_through() {
        let registry = default_publish_behaviors();
        let pipeline = Pipeline::compose(
            &[LOGGING_BEHAVIOR.to_owned(), METRICS_BEHAVIOR.to_owned()],
            &registry,
        );
        assert_eq!(pipeline.len(), 2);

        let ctx = publish_ctx();
        assert!(pipeline
            .execute(&ctx, || Box::pin(async { Ok(()) }))
            .await
            .is_ok());

        let result = pipeline
            .execute(&ctx, || {
                Box::pin(async { Err(MessagingError::MissingReplyTo) })
            })
            .await;
        assert!(matches!(result, Err(MessagingError::MissingReplyTo)));
    }
}
