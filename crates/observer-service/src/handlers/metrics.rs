//! Metrics exposition handler.
//!
//! Serves the registry snapshot in OpenMetrics text format, exemplars
//! included.
//!
//! # Security
//!
//! This endpoint is unauthenticated to allow Prometheus to scrape metrics.
//! Labels carry route templates and status codes only; trace ids appear on
//! exemplar lines, never as series labels.

use crate::errors::fallible;
use crate::middleware::sink::{Handler, ResponseSink};
use crate::observability::metrics::{MetricsRegistry, OPENMETRICS_CONTENT_TYPE};
use axum::http::{header, HeaderValue, StatusCode};
use std::sync::Arc;

/// Handler for GET /metrics
///
/// # Response
///
/// Returns 200 OK with OpenMetrics text:
/// ```text
/// # HELP http_requests Total count of requests by method and path.
/// # TYPE http_requests counter
/// http_requests_total{method="GET",path="/health",app_name="app"} 42
/// ```
pub fn metrics_handler(registry: Arc<MetricsRegistry>) -> impl Handler {
    fallible(move |w: &mut dyn ResponseSink, _request| {
        let body = registry.encode()?;
        w.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE),
        );
        w.write_header(StatusCode::OK);
        w.write(body.as_bytes())?;
        Ok(())
    })
}
