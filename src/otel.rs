// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels with each message in its string headers. The publisher
//! injects the current context before sending; the consume path extracts it and
//! opens a consumer span around the dispatch of the delivery.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Adapter letting the global propagator read and write message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Headers carrying `ctx` for an outgoing message.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });

    headers
}

/// Creates a consumer span named `name`, parented on the context found in `headers`.
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
