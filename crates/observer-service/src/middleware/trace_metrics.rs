//! Tracing + metrics middleware.
//!
//! For every request, in order:
//! 1. start the server span and bind its context into the request
//! 2. check a [`StatusWriter`] out of the pool, bound to the real sink
//! 3. count the request and raise the in-progress gauge
//! 4. run the wrapped handler
//! 5. end the span with the captured status
//! 6. observe the duration (plain and exemplar histograms)
//! 7. count the response, lower the gauge, release the writer
//!
//! Route labels are computed once, so the gauge increment and decrement
//! and the counters always agree. Steps 5 to 7 also run when the handler
//! panics. The panic is resumed afterwards.

use super::sink::{Handler, HttpRequest, ResponseSink};
use super::span::{PublicEndpointFn, SharedPropagator, SpanManager, SpanNameFormatter};
use super::status_writer::{SharedWriterPool, StatusWriter, WriterPool};
use crate::observability::metrics::{ExemplarLabels, HttpMetrics, RouteLabels};
use axum::http::StatusCode;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::Tracer;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Instrumentation scope used for the default global tracer.
pub const TRACER_NAME: &str = "observer-service";

/// Builder for [`TraceMetrics`].
pub struct TraceMetricsBuilder<T> {
    service: String,
    tracer: T,
    propagator: Option<SharedPropagator>,
    span_name: Option<SpanNameFormatter>,
    public_endpoint: bool,
    public_endpoint_fn: Option<PublicEndpointFn>,
    pool: Arc<dyn WriterPool>,
}

impl TraceMetricsBuilder<BoxedTracer> {
    /// Start from the global tracer provider and a shared writer pool.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tracer: global::tracer(TRACER_NAME),
            propagator: None,
            span_name: None,
            public_endpoint: false,
            public_endpoint_fn: None,
            pool: Arc::new(SharedWriterPool::default()),
        }
    }
}

impl<T> TraceMetricsBuilder<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    /// Use an explicit tracer instead of the global one.
    pub fn tracer<U>(self, tracer: U) -> TraceMetricsBuilder<U> {
        TraceMetricsBuilder {
            service: self.service,
            tracer,
            propagator: self.propagator,
            span_name: self.span_name,
            public_endpoint: self.public_endpoint,
            public_endpoint_fn: self.public_endpoint_fn,
            pool: self.pool,
        }
    }

    pub fn propagator(mut self, propagator: SharedPropagator) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub fn span_name_formatter(mut self, formatter: SpanNameFormatter) -> Self {
        self.span_name = Some(formatter);
        self
    }

    pub fn public_endpoint(mut self, public: bool) -> Self {
        self.public_endpoint = public;
        self
    }

    pub fn public_endpoint_fn(mut self, predicate: PublicEndpointFn) -> Self {
        self.public_endpoint_fn = Some(predicate);
        self
    }

    pub fn writer_pool(mut self, pool: Arc<dyn WriterPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Wrap `inner`, recording into `metrics`.
    pub fn build<H: Handler>(self, metrics: Arc<HttpMetrics>, inner: H) -> TraceMetrics<H, T> {
        let mut spans = SpanManager::new(self.service, self.tracer)
            .with_public_endpoint(self.public_endpoint);
        if let Some(propagator) = self.propagator {
            spans = spans.with_propagator(propagator);
        }
        if let Some(formatter) = self.span_name {
            spans = spans.with_span_name_formatter(formatter);
        }
        if let Some(predicate) = self.public_endpoint_fn {
            spans = spans.with_public_endpoint_fn(predicate);
        }

        TraceMetrics {
            spans,
            metrics,
            pool: self.pool,
            inner,
        }
    }
}

/// Handler wrapper that traces and measures every request.
pub struct TraceMetrics<H, T> {
    spans: SpanManager<T>,
    metrics: Arc<HttpMetrics>,
    pool: Arc<dyn WriterPool>,
    inner: H,
}

impl<H, T> TraceMetrics<H, T> {
    pub fn metrics(&self) -> &Arc<HttpMetrics> {
        &self.metrics
    }
}

impl<H, T> Handler for TraceMetrics<H, T>
where
    H: Handler,
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn serve(&self, w: &mut dyn ResponseSink, mut request: HttpRequest) {
        let request_span = self.spans.start(&mut request);
        let labels = RouteLabels::new(
            request.method().as_str(),
            request_span.route().as_str(),
            self.metrics.app_name(),
        );

        let mut writer = StatusWriter::acquire(self.pool.as_ref(), w);
        let in_flight = self.metrics.track_in_flight(&labels);
        let start = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.serve(&mut writer, request);
        }));

        let elapsed = start.elapsed();
        // A handler that died before committing never produced a 200
        let status = match &outcome {
            Err(_) if !writer.written() => StatusCode::INTERNAL_SERVER_ERROR,
            _ => writer.status(),
        };

        let ids = request_span.ids();
        tracing::debug!(
            target: "observer.http",
            method = %labels.method,
            path = %labels.path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            trace_id = ids.as_ref().map(|(trace_id, _)| trace_id.as_str()).unwrap_or_default(),
            panicked = outcome.is_err(),
            "Request observed"
        );

        self.spans.finish(request_span, status);
        self.metrics.observe_duration(&labels, elapsed);
        self.metrics.observe_duration_with_exemplar(
            elapsed,
            ids.map(|(trace_id, span_id)| ExemplarLabels::new(trace_id, span_id, &labels)),
        );
        self.metrics.record_response(&labels, status.as_u16());
        drop(in_flight);
        writer.release();

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }
}

impl<H, T> fmt::Debug for TraceMetrics<H, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceMetrics")
            .field("spans", &self.spans)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::middleware::sink::{write_json, write_text, BufferedResponse};
    use crate::middleware::span::MatchedRoute;
    use crate::middleware::status_writer::FreshWriters;
    use crate::observability::metrics::MetricsRegistry;
    use crate::observability::testing::{count_series, sample_value, InMemoryTracing};
    use axum::http::{HeaderValue, Request};
    use bytes::Bytes;
    use opentelemetry::trace::{Status, TraceContextExt};
    use opentelemetry::Context;
    use std::sync::Mutex;
    use std::thread;

    const APP: &str = "test-app";

    struct Fixture {
        registry: MetricsRegistry,
        metrics: Arc<HttpMetrics>,
        tracing: InMemoryTracing,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = MetricsRegistry::new();
            let metrics = Arc::new(HttpMetrics::register(&mut registry, APP).unwrap());
            Self {
                registry,
                metrics,
                tracing: InMemoryTracing::new(),
            }
        }

        fn wrap<H: Handler>(
            &self,
            handler: H,
        ) -> TraceMetrics<H, opentelemetry_sdk::trace::Tracer> {
            TraceMetricsBuilder::new(APP)
                .tracer(self.tracing.tracer())
                .build(Arc::clone(&self.metrics), handler)
        }
    }

    fn routed(method: &str, path: &str) -> HttpRequest {
        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap();
        request
            .extensions_mut()
            .insert(MatchedRoute::from_template(path));
        request
    }

    fn unrouted(method: &str, path: &str) -> HttpRequest {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn test_successful_request_is_counted_once() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            write_json(w, &serde_json::json!({"status": "OK"}));
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/health"));

        let labels = RouteLabels::new("GET", "/health", APP);
        assert_eq!(sink.committed_status(), Some(StatusCode::OK));
        assert_eq!(fixture.metrics.requests_total(&labels), 1);
        assert_eq!(fixture.metrics.responses_total(&labels, 200), 1);
        assert_eq!(fixture.metrics.in_progress(&labels), 0);

        let text = fixture.registry.encode().unwrap();
        assert_eq!(
            sample_value(
                &text,
                "http_requests_duration_seconds_count{method=\"GET\",path=\"/health\",app_name=\"test-app\"}"
            ),
            Some(1.0)
        );
        assert_eq!(
            sample_value(
                &text,
                "http_requests_total{method=\"GET\",path=\"/health\",app_name=\"test-app\"}"
            ),
            Some(1.0)
        );

        let spans = fixture.tracing.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "/health");
        assert_eq!(spans[0].status, Status::Unset);
    }

    #[test]
    fn test_server_error_is_labelled_with_status() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            write_text(w, StatusCode::INTERNAL_SERVER_ERROR, "got error!!!!");
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/error_test"));

        let labels = RouteLabels::new("GET", "/error_test", APP);
        assert_eq!(fixture.metrics.responses_total(&labels, 500), 1);
        assert_eq!(fixture.metrics.responses_total(&labels, 200), 0);
        assert!(matches!(
            fixture.tracing.finished_spans()[0].status,
            Status::Error { .. }
        ));
    }

    #[test]
    fn test_response_passes_through_unchanged() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            w.headers_mut()
                .insert("x-custom", HeaderValue::from_static("yes"));
            w.write_header(StatusCode::CREATED);
            w.write(b"created").unwrap();
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("POST", "/items"));

        assert_eq!(sink.committed_status(), Some(StatusCode::CREATED));
        assert_eq!(sink.body(), b"created");
        let response = axum::response::IntoResponse::into_response(sink);
        assert_eq!(response.headers()["x-custom"], "yes");
    }

    #[test]
    fn test_zero_write_handler_is_recorded_as_ok() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|_w: &mut dyn ResponseSink, _req: HttpRequest| {});

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/"));

        let labels = RouteLabels::new("GET", "/", APP);
        assert_eq!(fixture.metrics.responses_total(&labels, 200), 1);
        assert_eq!(fixture.metrics.in_progress(&labels), 0);
    }

    #[test]
    fn test_body_before_header_keeps_implicit_ok() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            w.write(b"hello").unwrap();
            w.write_header(StatusCode::NOT_FOUND);
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/"));

        let labels = RouteLabels::new("GET", "/", APP);
        assert_eq!(sink.committed_status(), Some(StatusCode::OK));
        assert_eq!(fixture.metrics.responses_total(&labels, 200), 1);
        assert_eq!(fixture.metrics.responses_total(&labels, 404), 0);
    }

    #[test]
    fn test_panicking_handler_still_finalizes() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|_w: &mut dyn ResponseSink, _req: HttpRequest| {
            panic!("handler blew up");
        });

        let mut sink = BufferedResponse::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            chain.serve(&mut sink, routed("GET", "/boom"));
        }));
        assert!(outcome.is_err(), "panic must propagate");

        let labels = RouteLabels::new("GET", "/boom", APP);
        assert_eq!(fixture.metrics.in_progress(&labels), 0);
        assert_eq!(fixture.metrics.requests_total(&labels), 1);
        assert_eq!(fixture.metrics.responses_total(&labels, 500), 1);

        let spans = fixture.tracing.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[test]
    fn test_panic_after_commit_keeps_committed_status() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            w.write_header(StatusCode::NOT_FOUND);
            panic!("late failure");
        });

        let mut sink = BufferedResponse::new();
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            chain.serve(&mut sink, routed("GET", "/late"));
        }));

        let labels = RouteLabels::new("GET", "/late", APP);
        assert_eq!(fixture.metrics.responses_total(&labels, 404), 1);
        assert_eq!(fixture.metrics.in_progress(&labels), 0);
    }

    #[test]
    fn test_unmatched_paths_share_one_series() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            write_text(w, StatusCode::NOT_FOUND, "404 page not found\n");
        });

        for path in ["/xyz", "/abc", "/xyz/deeper"] {
            let mut sink = BufferedResponse::new();
            chain.serve(&mut sink, unrouted("GET", path));
        }

        let labels = RouteLabels::new("GET", "HTTP GET route not found", APP);
        assert_eq!(fixture.metrics.requests_total(&labels), 3);
        assert_eq!(fixture.metrics.responses_total(&labels, 404), 3);

        let text = fixture.registry.encode().unwrap();
        assert_eq!(count_series(&text, "http_requests_total", "path=\"/xyz\""), 0);
        assert_eq!(
            count_series(
                &text,
                "http_requests_total",
                "path=\"HTTP GET route not found\""
            ),
            1
        );
    }

    #[test]
    fn test_exemplar_carries_the_request_trace_id() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            w.write(b"ok").unwrap();
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/"));

        let spans = fixture.tracing.finished_spans();
        let trace_id = spans[0].span_context.trace_id().to_string();
        let span_id = spans[0].span_context.span_id().to_string();

        let text = fixture.registry.encode().unwrap();
        let exemplar_line = text
            .lines()
            .find(|line| line.contains(&format!("trace_id=\"{trace_id}\"")))
            .expect("exemplar with the span's trace id");
        assert!(exemplar_line.starts_with("http_requests_duration_seconds_exemplar_bucket"));
        assert!(exemplar_line.contains(&format!("span_id=\"{span_id}\"")));
        assert_eq!(
            sample_value(&text, "http_requests_duration_seconds_exemplar_count"),
            Some(1.0)
        );
    }

    #[test]
    fn test_handler_sees_span_bound_context() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = Arc::clone(&seen);
        let chain = fixture.wrap(move |_w: &mut dyn ResponseSink, req: HttpRequest| {
            let trace_id = req
                .extensions()
                .get::<Context>()
                .map(|cx| cx.span().span_context().trace_id().to_string());
            *seen_in_handler.lock().unwrap() = trace_id;
        });

        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, routed("GET", "/"));

        let spans = fixture.tracing.finished_spans();
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(spans[0].span_context.trace_id().to_string())
        );
    }

    #[test]
    fn test_concurrent_requests_are_counted_exactly() {
        let fixture = Fixture::new();
        let chain = fixture.wrap(|w: &mut dyn ResponseSink, _req: HttpRequest| {
            write_text(w, StatusCode::OK, "hello world");
        });

        thread::scope(|scope| {
            for _ in 0..50 {
                scope.spawn(|| {
                    let mut sink = BufferedResponse::new();
                    chain.serve(&mut sink, routed("GET", "/"));
                });
            }
        });

        let labels = RouteLabels::new("GET", "/", APP);
        assert_eq!(fixture.metrics.requests_total(&labels), 50);
        assert_eq!(fixture.metrics.responses_total(&labels, 200), 50);
        assert_eq!(fixture.metrics.in_progress(&labels), 0);
        assert_eq!(fixture.tracing.finished_spans().len(), 50);
    }

    #[test]
    fn test_pool_choice_is_not_observable() {
        let pooled = Arc::new(SharedWriterPool::new(8));
        let handler = |w: &mut dyn ResponseSink, req: HttpRequest| {
            if req.uri().path() == "/missing" {
                w.write_header(StatusCode::NOT_FOUND);
            } else {
                w.write(b"ok").unwrap();
            }
        };

        let mut results = Vec::new();
        for pool in [
            Arc::clone(&pooled) as Arc<dyn WriterPool>,
            Arc::new(FreshWriters) as Arc<dyn WriterPool>,
        ] {
            let fixture = Fixture::new();
            let chain = TraceMetricsBuilder::new(APP)
                .tracer(fixture.tracing.tracer())
                .writer_pool(pool)
                .build(Arc::clone(&fixture.metrics), handler);

            for path in ["/", "/missing", "/", "/missing"] {
                let mut sink = BufferedResponse::new();
                chain.serve(&mut sink, routed("GET", path));
            }

            let ok = RouteLabels::new("GET", "/", APP);
            let missing = RouteLabels::new("GET", "/missing", APP);
            results.push((
                fixture.metrics.responses_total(&ok, 200),
                fixture.metrics.responses_total(&missing, 404),
            ));
        }

        assert_eq!(results[0], (2, 2));
        assert_eq!(results[0], results[1]);
        // Sequential requests reuse a single parked state
        assert_eq!(pooled.idle_len(), 1);
    }
}
