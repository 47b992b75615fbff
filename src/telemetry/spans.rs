//! Span utilities for decoding steps.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for decoding-step spans.
pub struct StepSpan;

impl StepSpan {
    /// Create a span for one `forward` call.
    ///
    /// `status`, `error.message`, `accepted` and `rejected` are left empty
    /// for the layer to fill in.
    pub fn new(layer: &'static str, batch_size: usize, step: usize) -> Span {
        info_span!(
            "decoding_step",
            layer = layer,
            batch_size = batch_size,
            step = step,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            accepted = tracing::field::Empty,
            rejected = tracing::field::Empty,
        )
    }
}
