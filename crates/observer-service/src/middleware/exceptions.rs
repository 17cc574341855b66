//! Exception-counting outer wrapper.
//!
//! Outermost layer of the chain. It watches the status the client receives
//! through its own small recorder (never the pooled [`StatusWriter`]), and
//! counts every response with status >= 400 in `http_exceptions_total`,
//! labelled with the canonical reason phrase.
//!
//! [`StatusWriter`]: super::status_writer::StatusWriter

use super::sink::{Handler, HttpRequest, ResponseSink};
use super::span::{route_not_found, MatchedRoute, RouteLabel};
use crate::observability::metrics::HttpMetrics;
use axum::http::{HeaderMap, StatusCode};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Wraps a handler chain and counts failed responses.
#[derive(Debug)]
pub struct ExceptionCounter<H> {
    metrics: Arc<HttpMetrics>,
    inner: H,
}

impl<H: Handler> ExceptionCounter<H> {
    pub fn new(metrics: Arc<HttpMetrics>, inner: H) -> Self {
        Self { metrics, inner }
    }
}

impl<H: Handler> Handler for ExceptionCounter<H> {
    fn serve(&self, w: &mut dyn ResponseSink, request: HttpRequest) {
        let method = request.method().clone();
        let matched = RouteLabel::resolve(&method, request.extensions().get::<MatchedRoute>())
            .is_matched();
        // Unmatched paths collapse onto one marker to keep the series bounded
        let path = if matched {
            request.uri().path().to_string()
        } else {
            route_not_found(&method)
        };

        let mut recorder = ExceptionRecorder::new(w);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.serve(&mut recorder, request);
        }));

        let status = match (recorder.status, &outcome) {
            (Some(status), _) => status,
            (None, Err(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            (None, Ok(())) => StatusCode::OK,
        };

        if status.as_u16() >= 400 {
            let exception_type = status.canonical_reason().unwrap_or("Unknown Status");
            tracing::debug!(
                target: "observer.http",
                method = %method,
                path = %path,
                status = status.as_u16(),
                exception_type,
                "Exception recorded"
            );
            self.metrics
                .record_exception(method.as_str(), &path, exception_type);
        }

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }
}

/// Non-pooled first-commit recorder used only by [`ExceptionCounter`].
struct ExceptionRecorder<'a> {
    sink: &'a mut dyn ResponseSink,
    status: Option<StatusCode>,
}

impl<'a> ExceptionRecorder<'a> {
    fn new(sink: &'a mut dyn ResponseSink) -> Self {
        Self { sink, status: None }
    }
}

impl ResponseSink for ExceptionRecorder<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.sink.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status.get_or_insert(status);
        self.sink.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.status.get_or_insert(StatusCode::OK);
        self.sink.write(buf)
    }
}
