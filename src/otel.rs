// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers and opens consumer-kind
//! spans around dispatch. The globally installed text-map propagator decides
//! the header format.

use crate::transport::{HeaderValue, Headers};
use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::{SpanKind, Tracer};
use opentelemetry::Context;
use std::borrow::Cow;

/// Adapter injecting and extracting trace context on message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Injects the current context into outgoing headers.
pub(crate) fn inject_context(cx: &Context, headers: &mut Headers) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderPropagator::new(headers))
    });
}

/// Extracts the upstream context from delivery headers and starts a
/// consumer-kind span under it.
pub(crate) fn consumer_span(
    headers: &Headers,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &cx);

    (cx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagator_reads_and_writes_string_headers() {
        let mut headers = Headers::new();
        {
            let mut injector = HeaderPropagator::new(&mut headers);
            injector.set("Traceparent", "00-abc-def-01".to_owned());
        }
        let extractor = HeaderPropagator::new(&mut headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
