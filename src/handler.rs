// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events and Handlers
//!
//! Typed contracts implemented by applications: [`Event`] marks a message
//! schema, [`EventHandler`] handles one event of that schema and
//! [`RpcRequestHandler`] answers one RPC request.

use crate::{context::SubscribeMessageContext, errors::HandlerError};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// A message schema exchanged over the broker.
///
/// The type name is the identity used to resolve publish targets and to match
/// configured subscriptions. It defaults to the type name without its module
/// path, so `billing::Invoice` is `Invoice`. Override it when two services
/// must agree on a name their types do not share.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Strips the module path of a type name. Generic arguments are kept as is.
fn short_type_name(full: &'static str) -> &'static str {
    let end = full.find('<').unwrap_or(full.len());
    let start = full[..end].rfind("::").map(|i| i + 2).unwrap_or(0);
    &full[start..]
}

/// Handles one event of type `E`.
///
/// The inbound message context is passed explicitly so that handlers can
/// answer RPC requests with
/// [`EventsPublisher::publish_rpc_response`](crate::publisher::EventsPublisher::publish_rpc_response).
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, ctx: &SubscribeMessageContext, event: E) -> Result<(), HandlerError>;
}

/// Answers the RPC request `E` with the response `R`.
///
/// Registered with
/// [`HandlerRegistry::register_rpc_handler`](crate::handlers::HandlerRegistry::register_rpc_handler),
/// the response is published to the reply-to of the request with its
/// correlation id once the handler returns.
#[async_trait]
pub trait RpcRequestHandler<E: Event, R: Event>: Send + Sync {
    async fn handle(&self, ctx: &SubscribeMessageContext, request: E) -> Result<R, HandlerError>;
}
