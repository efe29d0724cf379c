// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Consumer
//!
//! Handles one inbound delivery: resolves the subscription it belongs to,
//! opens a consumer span and runs the subscription's handler. A handled
//! delivery is acknowledged, a failed one is rejected without requeue. A
//! delivery of a subscription with no registered handler is left
//! unacknowledged for the broker to redeliver on another consumer.

use crate::{
    channel::ChannelFactory,
    context::{ScopeStore, SubscribeMessageContext},
    dispatcher::EventsHandlerService,
    errors::MessagingError,
    otel,
    transport::{BrokerChannel, InboundDelivery},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) struct DeliveryConsumer {
    channels: Arc<ChannelFactory>,
    service: Arc<EventsHandlerService>,
    scopes: Arc<ScopeStore>,
    tracer: BoxedTracer,
}

impl DeliveryConsumer {
    pub(crate) fn new(
        channels: Arc<ChannelFactory>,
        service: Arc<EventsHandlerService>,
        scopes: Arc<ScopeStore>,
    ) -> Self {
        Self {
            channels,
            service,
            scopes,
            tracer: otel::tracer(),
        }
    }

    pub(crate) async fn consume(&self, delivery: InboundDelivery) {
        let Some((connection, subscription)) = self
            .channels
            .try_get_subscription_keys(&delivery.consumer_tag, &delivery.routing_key)
        else {
            error!(
                consumer_tag = delivery.consumer_tag,
                routing_key = delivery.routing_key,
                "no subscription found for the delivery, dropping it"
            );
            return;
        };

        // An RPC response continues the trace of the call that is waiting for it.
        let parent = delivery
            .properties
            .correlation_id()
            .and_then(|id| self.scopes.take(id))
            .unwrap_or_else(|| otel::extract(&delivery.properties.headers));

        let span_name = format!("{} receive", subscription.queue.name());
        let cx = otel::new_span(&parent, &self.tracer, &span_name);

        debug!(
            connection = connection.name(),
            subscription = %subscription,
            delivery_tag = delivery.delivery_tag,
            "received message"
        );

        let delivery_tag = delivery.delivery_tag;
        let ctx = SubscribeMessageContext {
            connection,
            subscription,
            delivery,
            otel: cx.clone(),
        };

        let span = cx.span();
        match self.service.handle(&ctx).await {
            Ok(()) => match self.channel(&ctx) {
                Some(channel) => match channel.basic_ack(delivery_tag).await {
                    Ok(()) => span.set_status(Status::Ok),
                    Err(err) => {
                        error!(error = err.to_string(), delivery_tag, "failure to ack message");
                        span.record_error(&err);
                        span.set_status(Status::error("failure to ack message"));
                    }
                },
                None => span.set_status(Status::error("subscribe channel not found")),
            },
            Err(err @ MessagingError::HandlerNotFound(_)) => {
                warn!(
                    error = err.to_string(),
                    delivery_tag, "message left unacknowledged"
                );
                span.set_status(Status::error("handler not found"));
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    subscription = %ctx.subscription,
                    delivery_tag,
                    "failure to handle message"
                );
                span.record_error(&err);
                span.set_status(Status::error(err.to_string()));

                if let Some(channel) = self.channel(&ctx) {
                    if let Err(err) = channel.basic_nack(delivery_tag, false).await {
                        error!(error = err.to_string(), delivery_tag, "failure to nack message");
                    }
                }
            }
        }
    }

    fn channel(&self, ctx: &SubscribeMessageContext) -> Option<Arc<dyn BrokerChannel>> {
        let channel = self
            .channels
            .subscribe_channel(&ctx.connection, &ctx.subscription);
        if channel.is_none() {
            error!(
                connection = ctx.connection.name(),
                subscription = %ctx.subscription,
                "subscribe channel not found"
            );
        }
        channel
    }
}
