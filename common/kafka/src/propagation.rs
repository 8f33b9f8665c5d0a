//! Trace context carried in message headers.
//!
//! Producers write the W3C `traceparent`/`tracestate` and `baggage` headers on
//! every message; consumers read the same keys back to parent their processing
//! span on the producer's span.

use std::sync::Arc;

use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

use crate::message::MessageHeaders;

impl Injector for MessageHeaders {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key, value);
    }
}

impl Extractor for MessageHeaders {
    fn get(&self, key: &str) -> Option<&str> {
        self.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        MessageHeaders::keys(self).collect()
    }
}

/// Owned propagator handed to publishers and consumers, so nothing depends on
/// the process-wide propagator being installed.
#[derive(Clone)]
pub struct TracePropagator {
    inner: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Default for TracePropagator {
    fn default() -> Self {
        Self::new(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]))
    }
}

impl TracePropagator {
    pub fn new(propagator: impl TextMapPropagator + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(propagator),
        }
    }

    /// A context without a valid span writes no trace headers, baggage is
    /// written regardless.
    pub fn inject(&self, cx: &Context, headers: &mut MessageHeaders) {
        self.inner.inject_context(cx, headers);
    }

    pub fn extract(&self, headers: &MessageHeaders) -> Context {
        self.inner.extract(headers)
    }
}
