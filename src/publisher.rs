// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events Publisher
//!
//! Publishes events to the exchange and routing key resolved from the options
//! registry, answers RPC requests and performs RPC calls.
//!
//! Every message goes through the publish pipeline configured for its target.
//! The innermost step encodes the event, completes the message properties
//! (content type, message id, type, trace headers) and publishes on the cached
//! publish channel of the connection. Transport failures are retried with an
//! exponential backoff of `2^n` seconds, `retry_count` times at most.

use crate::{
    ask::AskManager,
    channel::ChannelFactory,
    codec::{self, CodecRegistry, MessageCodec},
    context::{PublishMessageContext, ScopeStore, SubscribeMessageContext},
    errors::{AskError, MessagingError},
    handler::Event,
    keys::{ConnectionKey, EventKey, PublishKey, RoutingKey},
    options::{PublishOptions, PublishParams},
    otel,
    pipeline::{BehaviorRegistry, Pipeline},
    registry::OptionsRegistry,
    retry::{RetryPolicy, PUBLISH_BACKOFF_BASE},
    transport::{MessageProperties, CORRELATION_ID_HEADER},
};
use dashmap::DashMap;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type PublishPipeline = Pipeline<PublishMessageContext, MessagingError>;

/// Bookkeeping of an RPC call in flight. Dropping it stops the timer and
/// releases the slot and the saved scope, whether the call completed, failed
/// or was abandoned by its caller.
struct PendingAsk<'a> {
    correlation_id: &'a str,
    asks: &'a AskManager,
    scopes: &'a ScopeStore,
    timer: JoinHandle<()>,
}

impl Drop for PendingAsk<'_> {
    fn drop(&mut self) {
        self.timer.abort();
        if self.asks.cancel(self.correlation_id, AskError::Cancelled).is_ok() {
            debug!(correlation_id = self.correlation_id, "rpc call abandoned");
        }
        self.scopes.take(self.correlation_id);
    }
}

pub struct EventsPublisher {
    registry: Arc<OptionsRegistry>,
    channels: Arc<ChannelFactory>,
    codecs: Arc<CodecRegistry>,
    asks: Arc<AskManager>,
    scopes: Arc<ScopeStore>,
    behaviors: BehaviorRegistry<PublishMessageContext, MessagingError>,
    pipelines: DashMap<(ConnectionKey, PublishKey), Arc<PublishPipeline>>,
}

impl EventsPublisher {
    pub fn new(
        registry: Arc<OptionsRegistry>,
        channels: Arc<ChannelFactory>,
        codecs: Arc<CodecRegistry>,
        asks: Arc<AskManager>,
        scopes: Arc<ScopeStore>,
        behaviors: BehaviorRegistry<PublishMessageContext, MessagingError>,
    ) -> Self {
        Self {
            registry,
            channels,
            codecs,
            asks,
            scopes,
            behaviors,
            pipelines: DashMap::default(),
        }
    }

    /// Publishes the event to its only configured target.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), MessagingError> {
        self.publish_with(event, &PublishParams::default()).await
    }

    /// Publishes the event, the explicit parameters winning over resolution.
    pub async fn publish_with<E: Event>(
        &self,
        event: &E,
        params: &PublishParams,
    ) -> Result<(), MessagingError> {
        let (connection, target) = self.resolve(EventKey::of::<E>(), params)?;
        let options = self.registry.publish_options(&connection, &target)?;

        let properties = MessageProperties {
            delivery_mode: Some(options.delivery_mode),
            ..Default::default()
        };

        self.send(event, connection, target.clone(), &target, options, properties)
            .await
            .inspect_err(|err| {
                warn!(
                    error = err.to_string(),
                    event = E::type_name(),
                    "failure to publish event"
                )
            })
    }

    /// Answers the RPC request being handled in `ctx`.
    ///
    /// The response goes to the request's reply-to on the exchange configured
    /// for the response event, on the connection the request arrived on, with
    /// the request's correlation id.
    pub async fn publish_rpc_response<E: Event>(
        &self,
        ctx: &SubscribeMessageContext,
        event: &E,
    ) -> Result<(), MessagingError> {
        let connection = ctx.connection.clone();
        let event_key = EventKey::of::<E>();
        let exchange = self
            .registry
            .exchange_for_publish_event(&connection, &event_key)?;
        let reply_to = ctx.reply_to().ok_or(MessagingError::MissingReplyTo)?;
        let correlation_id = ctx
            .correlation_id()
            .ok_or(MessagingError::MissingCorrelationId)?
            .to_owned();

        let target = PublishKey::new(&exchange, event_key, Some(RoutingKey::raw(reply_to)))?;
        let options_key = target.without_routing_key();
        let options = self.registry.publish_options(&connection, &options_key)?;

        let mut properties = MessageProperties {
            delivery_mode: Some(options.delivery_mode),
            correlation_id: Some(correlation_id.clone()),
            ..Default::default()
        };
        properties
            .headers
            .insert(CORRELATION_ID_HEADER.to_owned(), correlation_id.clone());

        debug!(
            correlation_id,
            reply_to,
            event = E::type_name(),
            "publishing rpc response"
        );

        self.send(event, connection, target, &options_key, options, properties)
            .await
            .inspect_err(|err| {
                warn!(
                    error = err.to_string(),
                    event = E::type_name(),
                    "failure to publish rpc response"
                )
            })
    }

    /// Sends the request `E` and waits for the response `A`.
    pub async fn ask<E: Event, A: Event>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<A, AskError> {
        self.ask_with(event, &PublishParams::default(), cancel).await
    }

    /// Sends the request `E` to the explicit target and waits for the
    /// response `A`.
    ///
    /// A cancelled token is only honoured before the request is published;
    /// once sent, the call ends with the response or the configured timeout.
    pub async fn ask_with<E: Event, A: Event>(
        &self,
        event: &E,
        params: &PublishParams,
        cancel: &CancellationToken,
    ) -> Result<A, AskError> {
        self.ask_private(event, params, cancel)
            .await
            .inspect_err(|err| {
                warn!(
                    error = err.to_string(),
                    request = E::type_name(),
                    response = A::type_name(),
                    "rpc call failed"
                )
            })
    }

    async fn ask_private<E: Event, A: Event>(
        &self,
        event: &E,
        params: &PublishParams,
        cancel: &CancellationToken,
    ) -> Result<A, AskError> {
        let (connection, target) = self.resolve(EventKey::of::<E>(), params)?;
        let options = self.registry.rpc_request_options(&connection, &target)?;

        if cancel.is_cancelled() {
            return Err(AskError::Cancelled);
        }

        let correlation_id = Uuid::new_v4().simple().to_string();
        let handle = self.asks.get_create_ask(&correlation_id)?;
        self.scopes.save(&correlation_id, Context::current());

        let timeout = options.timeout;
        let asks = self.asks.clone();
        let id = correlation_id.clone();
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            if asks.cancel(&id, AskError::Timeout(timeout)).is_ok() {
                info!(correlation_id = id, "no rpc response in time, request dropped");
            }
        });
        let _pending = PendingAsk {
            correlation_id: &correlation_id,
            asks: &self.asks,
            scopes: &self.scopes,
            timer,
        };

        let properties = MessageProperties {
            delivery_mode: Some(options.publish.delivery_mode),
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(options.reply_to.key().to_owned()),
            ..Default::default()
        };

        debug!(
            correlation_id,
            reply_to = options.reply_to.key(),
            "publishing rpc request"
        );

        self.send(
            event,
            connection,
            target.clone(),
            &target,
            &options.publish,
            properties,
        )
        .await?;

        handle
            .wait()
            .await?
            .downcast::<A>()
            .map(|answer| *answer)
            .map_err(|_| AskError::UnexpectedResponseType {
                expected: A::type_name(),
            })
    }

    /// Resolves connection, exchange and routing key of the event.
    ///
    /// An event configured without any routing key is published with none,
    /// as exchange-only targets are.
    fn resolve(
        &self,
        event: EventKey,
        params: &PublishParams,
    ) -> Result<(ConnectionKey, PublishKey), MessagingError> {
        let connection = self
            .registry
            .connection_key_for_publish_event(&event, params.connection.as_deref())?;

        let exchange = match params.exchange.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(exchange) => exchange.to_owned(),
            None => self.registry.exchange_for_publish_event(&connection, &event)?,
        };

        let routing_key = match params.routing_key.as_deref() {
            Some(key) => Some(RoutingKey::new(key)),
            None => match self.registry.routing_key_for_publish_event(&connection, &event) {
                Ok(key) => Some(key),
                Err(MessagingError::AmbiguousOrMissingRoutingKey { candidates, .. })
                    if candidates.is_empty() =>
                {
                    None
                }
                Err(err) => return Err(err),
            },
        };

        let target = PublishKey::new(&exchange, event, routing_key)?;
        Ok((connection, target))
    }

    fn pipeline(
        &self,
        connection: &ConnectionKey,
        key: &PublishKey,
        behaviors: &[String],
    ) -> Arc<PublishPipeline> {
        self.pipelines
            .entry((connection.clone(), key.clone()))
            .or_insert_with(|| Arc::new(Pipeline::compose(behaviors, &self.behaviors)))
            .value()
            .clone()
    }

    async fn send<E: Event>(
        &self,
        event: &E,
        connection: ConnectionKey,
        target: PublishKey,
        options_key: &PublishKey,
        options: &PublishOptions,
        properties: MessageProperties,
    ) -> Result<(), MessagingError> {
        let codec = self.codecs.get(&options.content_type)?;
        let pipeline = self.pipeline(&connection, options_key, &options.behaviors);

        let ctx = PublishMessageContext {
            connection,
            target,
            event_type: E::type_name(),
            content: codec::to_value(event)?,
            properties,
            otel: Context::current(),
        };

        let ctx = &ctx;
        let codec = codec.as_ref();
        let retry_count = options.retry_count;
        pipeline
            .execute(ctx, move || {
                Box::pin(self.deliver(ctx, codec, retry_count))
            })
            .await
    }

    async fn deliver(
        &self,
        ctx: &PublishMessageContext,
        codec: &dyn MessageCodec,
        retry_count: u32,
    ) -> Result<(), MessagingError> {
        let body = codec.encode(&ctx.content)?;

        let mut properties = ctx.properties.clone();
        properties.content_type = Some(codec.mime_type().to_owned());
        properties.message_id = Some(Uuid::new_v4().to_string());
        properties.kind = Some(ctx.event_type.to_owned());
        otel::inject(&ctx.otel, &mut properties.headers);

        let channels = &self.channels;
        let body = &body;
        let properties = &properties;

        RetryPolicy::exponential(retry_count, PUBLISH_BACKOFF_BASE)
            .execute(
                move || async move {
                    let channel = channels
                        .get_or_create_channel_for_publish(&ctx.connection)
                        .await?;
                    channel
                        .basic_publish(ctx.exchange(), ctx.routing_key(), body, properties)
                        .await?;
                    Ok::<(), MessagingError>(())
                },
                |err: &MessagingError| matches!(err, MessagingError::Transport(_)),
                |err: &MessagingError, wait: Duration, attempt: u32| {
                    error!(
                        error = err.to_string(),
                        exchange = ctx.exchange(),
                        routing_key = ctx.routing_key(),
                        attempt,
                        wait_secs = wait.as_secs_f64(),
                        "failure to publish message, retrying"
                    )
                },
            )
            .await
    }
}
