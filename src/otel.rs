// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in AMQP message headers. The lapin transport injects
//! the caller's current context on publish and, on delivery, extracts it to
//! start a consumer span around the application callback.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Injects and extracts OpenTelemetry context through AMQP headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns `props` with the current trace context added to its headers.
pub(crate) fn with_current_context(props: BasicProperties) -> BasicProperties {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut HeaderPropagator::new(&mut headers))
    });

    props.with_headers(FieldTable::from(headers))
}

/// Starts a consumer span whose parent is the context carried by `props`.
pub(crate) fn consumer_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_injected_headers() {
        let mut headers = BTreeMap::new();
        HeaderPropagator::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        let propagator = HeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn keeps_existing_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("x-app"), AMQPValue::LongString("v".into()));
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));

        let props = with_current_context(props);

        let headers = props.headers().as_ref().unwrap();
        assert!(headers.inner().contains_key("x-app"));
    }
}
