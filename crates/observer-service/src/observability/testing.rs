//! Test support shared by the in-file unit tests and `observer-test-utils`.
//!
//! Compiled for `cfg(test)` and behind the `test-utils` feature.

use crate::middleware::sink::ResponseSink;
use axum::http::{HeaderMap, StatusCode};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use std::io;

/// One call observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    WriteHeader(StatusCode),
    Write(Vec<u8>),
}

/// Sink that records every call in order.
///
/// The committed status follows the same first-commit-wins rule as the
/// real sink, so tests can compare what the client would have seen.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Vec<SinkCall>,
    headers: HeaderMap,
    committed: Option<StatusCode>,
    body: Vec<u8>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[SinkCall] {
        &self.calls
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Status the client would see: first commit, `200` after a bare body
    /// write, `None` if the handler never touched the sink.
    pub fn committed_status(&self) -> Option<StatusCode> {
        self.committed
    }
}

impl ResponseSink for RecordingSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.calls.push(SinkCall::WriteHeader(status));
        self.committed.get_or_insert(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.calls.push(SinkCall::Write(buf.to_vec()));
        self.committed.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// SDK tracer provider wired to an in-memory exporter.
///
/// Spans are exported synchronously when they end, so
/// [`InMemoryTracing::finished_spans`] is accurate as soon as the request
/// returns.
#[derive(Debug, Clone)]
pub struct InMemoryTracing {
    provider: TracerProvider,
    exporter: InMemorySpanExporter,
}

impl Default for InMemoryTracing {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTracing {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Self { provider, exporter }
    }

    pub fn tracer(&self) -> Tracer {
        self.provider.tracer("observer-service-test")
    }

    /// Spans that have ended so far. Empty if the exporter is unavailable.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap_or_default()
    }
}

/// Value of the sample whose series (name plus rendered label set) equals
/// `series` exactly, e.g. `http_requests_total{method="GET",path="/",app_name="app"}`.
pub fn sample_value(exposition: &str, series: &str) -> Option<f64> {
    exposition.lines().find_map(|line| {
        let rest = line.strip_prefix(series)?.strip_prefix(' ')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Number of exposition lines for metric family `name` whose labels
/// contain `fragment`.
pub fn count_series(exposition: &str, name: &str, fragment: &str) -> usize {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter(|line| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('{') && rest.contains(fragment))
        })
        .count()
}
