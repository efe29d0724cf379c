// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates the trace context through message headers: injected on every
//! publish, extracted on every delivery to parent the consumer span.

use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

pub(crate) const TRACER_NAME: &str = "rabbitmq-client";

/// Writes trace context entries into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from inbound message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

pub(crate) fn inject(cx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector::new(headers))
    });
}

pub(crate) fn extract(headers: &BTreeMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor::new(headers)))
}

pub(crate) fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Starts a consumer span under `parent` and returns the context carrying it.
pub(crate) fn new_span(parent: &Context, tracer: &BoxedTracer, name: &str) -> Context {
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, parent);

    parent.with_span(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    #[derive(Debug)]
    struct FixedPropagator;

    impl TextMapPropagator for FixedPropagator {
        fn inject_context(&self, _cx: &Context, injector: &mut dyn Injector) {
            injector.set("Trace-Id", "abc".to_owned());
        }

        fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
            match extractor.get("trace-id") {
                Some("abc") => cx.with_remote_span_context(SpanContext::new(
                    TraceId::from_bytes(1u128.to_be_bytes()),
                    SpanId::from_bytes(1u64.to_be_bytes()),
                    TraceFlags::SAMPLED,
                    true,
                    TraceState::default(),
                )),
                _ => cx.clone(),
            }
        }

        fn fields(&self) -> opentelemetry::propagation::text_map_propagator::FieldIter<'_> {
            opentelemetry::propagation::text_map_propagator::FieldIter::new(&[])
        }
    }

    #[test]
    fn headers_carry_the_context() {
        let propagator = FixedPropagator;
        let mut headers = BTreeMap::new();
        propagator.inject_context(&Context::new(), &mut HeaderInjector::new(&mut headers));
        assert_eq!(headers.get("trace-id").map(String::as_str), Some("abc"));

        let cx = propagator.extract(&HeaderExtractor::new(&headers));
        assert!(cx.span().span_context().is_remote());
    }
}
