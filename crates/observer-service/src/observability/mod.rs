//! Observability for the observer service.
//!
//! Metrics registry and definitions, trace pipeline setup, and log-trace
//! correlation helpers.

pub mod metrics;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use crate::middleware::sink::HttpRequest;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;

/// Trace and span ids to attach to log events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFields {
    pub trace_id: String,
    pub span_id: String,
}

/// Ids of the active span in `cx`. All zeros when there is none.
pub fn log_fields(cx: &Context) -> LogFields {
    let span = cx.span();
    let sc = span.span_context();
    LogFields {
        trace_id: sc.trace_id().to_string(),
        span_id: sc.span_id().to_string(),
    }
}

/// Ids of the server span bound to `request` by the tracing middleware.
pub fn request_log_fields(request: &HttpRequest) -> LogFields {
    match request.extensions().get::<Context>() {
        Some(cx) => log_fields(cx),
        None => log_fields(&Context::new()),
    }
}
