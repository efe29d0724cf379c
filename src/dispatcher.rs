// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events Handler Service
//!
//! Routes every inbound delivery to the handler registered for its
//! subscription, wrapped in the subscription's handle pipeline.
//!
//! Registration is keyed by connection and subscription and happens at most
//! once per key, which makes subscribing idempotent.

use crate::{
    ask::AskManager,
    codec::CodecRegistry,
    context::SubscribeMessageContext,
    errors::MessagingError,
    handlers::MessageHandler,
    keys::{ConnectionKey, SubscriptionKey},
    options::SubscriptionOptions,
    pipeline::Pipeline,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::debug;

pub type HandlePipeline = Pipeline<SubscribeMessageContext, MessagingError>;

/// Everything needed to handle the deliveries of one subscription.
pub struct Registration {
    pub options: SubscriptionOptions,
    pub handler: Arc<dyn MessageHandler>,
    pub pipeline: HandlePipeline,
}

pub struct EventsHandlerService {
    registrations: DashMap<(ConnectionKey, SubscriptionKey), Arc<Registration>>,
    codecs: Arc<CodecRegistry>,
    asks: Arc<AskManager>,
}

impl EventsHandlerService {
    pub fn new(codecs: Arc<CodecRegistry>, asks: Arc<AskManager>) -> Self {
        Self {
            registrations: DashMap::default(),
            codecs,
            asks,
        }
    }

    /// Registers the subscription unless it already is. Returns whether this
    /// call registered it.
    pub fn try_register(
        &self,
        connection: &ConnectionKey,
        key: &SubscriptionKey,
        registration: Registration,
    ) -> bool {
        match self.registrations.entry((connection.clone(), key.clone())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                debug!(
                    connection = connection.name(),
                    subscription = %key,
                    event = registration.handler.event_type(),
                    "subscription registered"
                );
                vacant.insert(Arc::new(registration));
                true
            }
        }
    }

    pub fn unregister(&self, connection: &ConnectionKey, key: &SubscriptionKey) {
        self.registrations.remove(&(connection.clone(), key.clone()));
    }

    pub fn is_registered(&self, connection: &ConnectionKey, key: &SubscriptionKey) -> bool {
        self.registrations
            .contains_key(&(connection.clone(), key.clone()))
    }

    /// Runs the pipeline and the handler of the delivery's subscription.
    pub async fn handle(&self, ctx: &SubscribeMessageContext) -> Result<(), MessagingError> {
        let registration = self
            .registrations
            .get(&(ctx.connection.clone(), ctx.subscription.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MessagingError::HandlerNotFound(ctx.subscription.clone()))?;

        let codecs = self.codecs.clone();
        let asks = self.asks.clone();
        let target = registration.clone();

        registration
            .pipeline
            .execute(ctx, move || {
                Box::pin(async move {
                    target
                        .handler
                        .handle(ctx, &target.options, &codecs, &asks)
                        .await
                })
            })
            .await
    }
}
