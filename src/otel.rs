// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: outgoing samples carry
//! the current context, and deliveries keep their string headers so a consumer
//! can continue the trace. Without a global propagator installed this is a no-op.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// Writes propagation fields into an AMQP header table.
struct AmqpHeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for AmqpHeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Reads propagation fields back out of delivery headers.
pub struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub fn new(headers: &'a BTreeMap<String, String>) -> Self {
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

/// Header table carrying `ctx` for an outgoing message.
pub(crate) fn trace_headers(ctx: &Context) -> FieldTable {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderInjector { headers: &mut headers })
    });

    FieldTable::from(headers)
}

/// String-valued entries of a delivery's header table. Other value types are skipped.
pub(crate) fn string_headers(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()?
                    .to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), text))
        })
        .collect()
}

/// Context propagated in a delivery's headers.
pub fn extract_context(headers: &BTreeMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor::new(headers)))
}

/// Consumer span parented on the context carried by `headers`.
pub(crate) fn consumer_span(headers: &BTreeMap<String, String>, queue: &str) -> BoxedSpan {
    let ctx = extract_context(headers);
    let tracer = global::tracer("sensehat-telemetry");

    tracer
        .span_builder(format!("{queue} receive"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        AmqpHeaderInjector {
            headers: &mut headers,
        }
        .set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc-def-01")))
        );
    }

    #[test]
    fn string_headers_skip_non_text_values() {
        let mut raw = BTreeMap::new();
        raw.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        raw.insert(ShortString::from("x-retries"), AMQPValue::LongInt(3));

        let headers = string_headers(Some(&FieldTable::from(raw)));

        assert_eq!(headers.len(), 1);
        assert_eq!(
            HeaderExtractor::new(&headers).get("traceparent"),
            Some("00-abc-def-01")
        );
        assert!(string_headers(None).is_empty());
    }
}
