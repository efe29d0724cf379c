// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Typed handlers registered by event type, erased behind [`MessageHandler`]
//! so that the dispatch service can invoke them from raw deliveries.
//!
//! An event can be registered without a handler, which is how RPC response
//! types are made known: their deliveries only complete pending calls.
//!
//! RPC request handlers return their response, which is published with the
//! publisher attached to the registry once the client is built.

use crate::{
    ask::AskManager,
    codec::CodecRegistry,
    context::SubscribeMessageContext,
    errors::{HandlerError, MessagingError},
    handler::{Event, EventHandler, RpcRequestHandler},
    keys::EventKey,
    options::SubscriptionOptions,
    publisher::EventsPublisher,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, OnceLock},
};
use tracing::{debug, warn};

/// Decodes a delivery into its event type and handles it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Type name of the handled event.
    fn event_type(&self) -> &'static str;

    async fn handle(
        &self,
        ctx: &SubscribeMessageContext,
        options: &SubscriptionOptions,
        codecs: &CodecRegistry,
        asks: &AskManager,
    ) -> Result<(), MessagingError>;
}

struct TypedHandler<E: Event> {
    handler: Option<Arc<dyn EventHandler<E>>>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E: Event> MessageHandler for TypedHandler<E> {
    fn event_type(&self) -> &'static str {
        E::type_name()
    }

    async fn handle(
        &self,
        ctx: &SubscribeMessageContext,
        options: &SubscriptionOptions,
        codecs: &CodecRegistry,
        asks: &AskManager,
    ) -> Result<(), MessagingError> {
        if options.correlation_enabled {
            let correlation_id = ctx
                .correlation_id()
                .ok_or(MessagingError::MissingCorrelationId)?;
            let answer: E = codecs.decode(&options.content_type, ctx.body())?;
            asks.set_answer(correlation_id, Box::new(answer))?;
            debug!(correlation_id, event = E::type_name(), "rpc answer delivered");
        }

        if !options.handler_enabled {
            return Ok(());
        }

        let Some(handler) = &self.handler else {
            return Err(MessagingError::HandlerNotRegistered(options.event.clone()));
        };

        let event: E = codecs.decode(&options.content_type, ctx.body())?;
        handler
            .handle(ctx, event)
            .await
            .map_err(MessagingError::Handler)
    }
}

/// Runs an RPC request handler and publishes its response.
struct RpcResponder<E: Event, R: Event> {
    handler: Arc<dyn RpcRequestHandler<E, R>>,
    publisher: Arc<OnceLock<Arc<EventsPublisher>>>,
}

#[async_trait]
impl<E: Event, R: Event> EventHandler<E> for RpcResponder<E, R> {
    async fn handle(&self, ctx: &SubscribeMessageContext, request: E) -> Result<(), HandlerError> {
        let publisher = self
            .publisher
            .get()
            .ok_or_else(|| MessagingError::PublisherNotAttached(EventKey::of::<E>()))?;

        let response = self.handler.handle(ctx, request).await?;
        publisher.publish_rpc_response(ctx, &response).await?;
        Ok(())
    }
}

/// Handlers by event type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKey, Arc<dyn MessageHandler>>,
    responses: Arc<OnceLock<Arc<EventsPublisher>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler of `E`, replacing a previous registration.
    pub fn register_handler<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.handlers.insert(
            EventKey::of::<E>(),
            Arc::new(TypedHandler {
                handler: Some(handler),
                _event: PhantomData,
            }),
        );
        self
    }

    /// Registers the handler answering the RPC request `E` with `R`,
    /// replacing a previous registration of `E`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use async_trait::async_trait;
    /// use rabbitmq_client::{
    ///     context::SubscribeMessageContext,
    ///     errors::HandlerError,
    ///     handler::{Event, RpcRequestHandler},
    ///     handlers::HandlerRegistry,
    /// };
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Serialize, Deserialize)]
    /// struct StockQuery { sku: String }
    /// impl Event for StockQuery {}
    ///
    /// #[derive(Serialize, Deserialize)]
    /// struct Stock { units: u32 }
    /// impl Event for Stock {}
    ///
    /// struct Warehouse;
    ///
    /// #[async_trait]
    /// impl RpcRequestHandler<StockQuery, Stock> for Warehouse {
    ///     async fn handle(
    ///         &self,
    ///         _ctx: &SubscribeMessageContext,
    ///         _request: StockQuery,
    ///     ) -> Result<Stock, HandlerError> {
    ///         Ok(Stock { units: 3 })
    ///     }
    /// }
    ///
    /// let mut handlers = HandlerRegistry::new();
    /// handlers.register_rpc_handler::<StockQuery, Stock, _>(Warehouse);
    /// ```
    pub fn register_rpc_handler<E, R, H>(&mut self, handler: H) -> &mut Self
    where
        E: Event,
        R: Event,
        H: RpcRequestHandler<E, R> + 'static,
    {
        let responder = RpcResponder {
            handler: Arc::new(handler),
            publisher: self.responses.clone(),
        };
        self.register_handler::<E, _>(responder)
    }

    /// Sets the publisher answering RPC requests. Only the first publisher
    /// attached is kept.
    pub fn attach_publisher(&self, publisher: Arc<EventsPublisher>) {
        if self.responses.set(publisher).is_err() {
            warn!("rpc response publisher already attached, keeping the first one");
        }
    }

    /// Makes `E` known without a handler. An existing registration is kept.
    pub fn register_event<E: Event>(&mut self) -> &mut Self {
        self.handlers
            .entry(EventKey::of::<E>())
            .or_insert_with(|| {
                Arc::new(TypedHandler::<E> {
                    handler: None,
                    _event: PhantomData,
                })
            });
        self
    }

    pub fn get(&self, event: &EventKey) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(event).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{AskError, HandlerError},
        keys::{ConnectionKey, QueueKey, RoutingKey, SubscriptionKey},
        transport::{InboundDelivery, MessageProperties},
    };
    use opentelemetry::Context;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Output {
        age: u32,
    }

    impl Event for Output {
        fn type_name() -> &'static str {
            "Output"
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Output>>,
    }

    #[async_trait]
    impl EventHandler<Output> for Arc<Recorder> {
        async fn handle(
            &self,
            _ctx: &SubscribeMessageContext,
            event: Output,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn ctx(body: &str, correlation_id: Option<&str>) -> SubscribeMessageContext {
        SubscribeMessageContext {
            connection: ConnectionKey::new("esb").unwrap(),
            subscription: SubscriptionKey::new(
                QueueKey::new("replies").unwrap(),
                RoutingKey::new("replies"),
            ),
            delivery: InboundDelivery {
                delivery_tag: 1,
                consumer_tag: "replies".to_owned(),
                exchange: "amq.direct".to_owned(),
                routing_key: "replies".to_owned(),
                body: body.as_bytes().to_vec(),
                properties: MessageProperties {
                    correlation_id: correlation_id.map(str::to_owned),
                    ..Default::default()
                },
            },
            otel: Context::new(),
        }
    }

    #[tokio::test]
    async fn correlated_delivery_completes_the_pending_call() {
        let mut registry = HandlerRegistry::new();
        registry.register_event::<Output>();
        let handler = registry.get(&EventKey::new("output").unwrap()).unwrap();

        let asks = AskManager::new();
        let pending = asks.get_create_ask("abc").unwrap();

        let mut options = SubscriptionOptions::new(EventKey::of::<Output>());
        options.correlation_enabled = true;
        options.handler_enabled = false;

        handler
            .handle(&ctx(r#"{"age":12}"#, Some("abc")), &options, &CodecRegistry::new(), &asks)
            .await
            .unwrap();

        let answer = pending.wait().await.unwrap();
        assert_eq!(*answer.downcast::<Output>().unwrap(), Output { age: 12 });
    }

    #[tokio::test]
    async fn correlated_delivery_without_id_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register_event::<Output>();
        let handler = registry.get(&EventKey::of::<Output>()).unwrap();

        let mut options = SubscriptionOptions::new(EventKey::of::<Output>());
        options.correlation_enabled = true;

        let result = handler
            .handle(&ctx(r#"{"age":1}"#, None), &options, &CodecRegistry::new(), &AskManager::new())
            .await;
        assert!(matches!(result, Err(MessagingError::MissingCorrelationId)));
    }

    #[tokio::test]
    async fn enabled_handler_receives_the_event() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = HandlerRegistry::new();
        registry.register_handler::<Output, _>(recorder.clone());
        // keeps the handler registered above
        registry.register_event::<Output>();

        let handler = registry.get(&EventKey::of::<Output>()).unwrap();
        assert_eq!(handler.event_type(), "Output");

        let options = SubscriptionOptions::new(EventKey::of::<Output>());
        handler
            .handle(&ctx(r#"{"age":3}"#, None), &options, &CodecRegistry::new(), &AskManager::new())
            .await
            .unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![Output { age: 3 }]);
    }

    #[tokio::test]
    async fn enabled_subscription_without_handler_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register_event::<Output>();
        let handler = registry.get(&EventKey::of::<Output>()).unwrap();

        let options = SubscriptionOptions::new(EventKey::of::<Output>());
        let result = handler
            .handle(&ctx(r#"{"age":3}"#, None), &options, &CodecRegistry::new(), &AskManager::new())
            .await;
        assert!(matches!(result, Err(MessagingError::HandlerNotRegistered(_))));
    }

    struct Doubler;

    #[async_trait]
    impl RpcRequestHandler<Output, Output> for Doubler {
        async fn handle(
            &self,
            _ctx: &SubscribeMessageContext,
            request: Output,
        ) -> Result<Output, HandlerError> {
            Ok(Output { age: request.age * 2 })
        }
    }

    #[tokio::test]
    async fn rpc_handler_needs_an_attached_publisher() {
        let mut registry = HandlerRegistry::new();
        registry.register_rpc_handler::<Output, Output, _>(Doubler);
        let handler = registry.get(&EventKey::of::<Output>()).unwrap();

        let options = SubscriptionOptions::new(EventKey::of::<Output>());
        let result = handler
            .handle(&ctx(r#"{"age":3}"#, Some("abc")), &options, &CodecRegistry::new(), &AskManager::new())
            .await;

        let Err(MessagingError::Handler(err)) = result else {
            panic!("expected a handler failure");
        };
        assert!(matches!(
            err.downcast_ref::<MessagingError>(),
            Some(MessagingError::PublisherNotAttached(_))
        ));
    }

    #[tokio::test]
    async fn late_answer_is_an_invalid_attempt() {
        let mut registry = HandlerRegistry::new();
        registry.register_event::<Output>();
        let handler = registry.get(&EventKey::of::<Output>()).unwrap();

        let asks = AskManager::new();
        let _pending = asks.get_create_ask("abc").unwrap();
        asks.cancel("abc", AskError::Cancelled).unwrap();

        let mut options = SubscriptionOptions::new(EventKey::of::<Output>());
        options.correlation_enabled = true;
        options.handler_enabled = false;

        let result = handler
            .handle(&ctx(r#"{"age":1}"#, Some("abc")), &options, &CodecRegistry::new(), &asks)
            .await;
        assert!(matches!(result, Err(MessagingError::InvalidAskAttempt(_))));
    }
}
