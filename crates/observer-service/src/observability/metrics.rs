//! HTTP metrics definitions and registry.
//!
//! All metrics follow Prometheus naming conventions:
//! - `http_` prefix for request/response series
//! - `_total` suffix for counters (added by the OpenMetrics encoder)
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: HTTP methods actually served
//! - `path`: the matched route template, or `"HTTP <METHOD> route not found"`
//!   when the router found no match; never the raw request path
//! - `status_code`: HTTP status codes returned
//! - `exception_type`: canonical status reason phrase (4xx/5xx only)
//! - `app_name`: one value per process
//!
//! Trace and span ids are attached as exemplars on a dedicated histogram and
//! never become series labels.
//!
//! # Registration
//!
//! [`HttpMetrics::register`] runs once at startup against an explicitly
//! constructed [`MetricsRegistry`]. Registering a name twice is a fatal
//! configuration error. Tests build their own registry per case.

use crate::errors::ServiceError;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Metric, Registry};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Content type of the OpenMetrics text exposition.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Request duration buckets in seconds (Prometheus client defaults).
pub const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
];

// ============================================================================
// Label sets
// ============================================================================

/// Labels shared by the request counter, in-progress gauge and duration
/// histogram. Computed once per request so increments and decrements agree.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub method: String,
    pub path: String,
    pub app_name: String,
}

impl RouteLabels {
    pub fn new(method: &str, path: &str, app_name: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            app_name: app_name.to_string(),
        }
    }
}

/// Labels for the response counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub method: String,
    pub path: String,
    pub status_code: String,
    pub app_name: String,
}

/// Labels for the exception counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExceptionLabels {
    pub method: String,
    pub path: String,
    pub exception_type: String,
    pub app_name: String,
}

/// Labels for the static process-identity gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AppLabels {
    pub app_name: String,
}

/// Out-of-band labels attached to a single exemplar observation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExemplarLabels {
    pub trace_id: String,
    pub span_id: String,
    pub method: String,
    pub path: String,
    pub app_name: String,
}

impl ExemplarLabels {
    pub fn new(trace_id: String, span_id: String, route: &RouteLabels) -> Self {
        Self {
            trace_id,
            span_id,
            method: route.method.clone(),
            path: route.path.clone(),
            app_name: route.app_name.clone(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide metrics registry.
///
/// Wraps a `prometheus-client` [`Registry`] and rejects duplicate names.
/// Metric handles are cheap clones sharing state with the registry, so the
/// registry itself is only needed again for exposition.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: Registry,
    names: HashSet<String>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `metric` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DuplicateMetric`] if `name` is already taken.
    pub fn register(
        &mut self,
        name: &str,
        help: &str,
        metric: impl Metric,
    ) -> Result<(), ServiceError> {
        if !self.names.insert(name.to_string()) {
            return Err(ServiceError::DuplicateMetric(name.to_string()));
        }
        self.inner.register(name, help, metric);
        Ok(())
    }

    /// Render the current snapshot in OpenMetrics text format.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::MetricsEncoding`] if encoding fails.
    pub fn encode(&self) -> Result<String, ServiceError> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner)?;
        Ok(buffer)
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("names", &self.names)
            .finish()
    }
}

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

// ============================================================================
// HTTP metrics
// ============================================================================

/// Handles to every HTTP metric the middleware chain updates.
#[derive(Clone, Debug)]
pub struct HttpMetrics {
    app_name: String,
    info: Family<AppLabels, Gauge>,
    requests: Family<RouteLabels, Counter>,
    responses: Family<ResponseLabels, Counter>,
    duration: Family<RouteLabels, Histogram, fn() -> Histogram>,
    duration_exemplar: HistogramWithExemplars<ExemplarLabels>,
    exceptions: Family<ExceptionLabels, Counter>,
    in_progress: Family<RouteLabels, Gauge>,
}

impl HttpMetrics {
    /// Register all HTTP metrics and set `app_info{app_name} = 1`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DuplicateMetric`] if any name is already
    /// registered, e.g. when called twice against the same registry.
    pub fn register(registry: &mut MetricsRegistry, app_name: &str) -> Result<Self, ServiceError> {
        let metrics = Self {
            app_name: app_name.to_string(),
            info: Family::default(),
            requests: Family::default(),
            responses: Family::default(),
            duration: Family::new_with_constructor(duration_histogram as fn() -> Histogram),
            duration_exemplar: HistogramWithExemplars::new(DURATION_BUCKETS.iter().copied()),
            exceptions: Family::default(),
            in_progress: Family::default(),
        };

        registry.register("app_info", "application information", metrics.info.clone())?;
        registry.register(
            "http_requests",
            "Total count of requests by method and path",
            metrics.requests.clone(),
        )?;
        registry.register(
            "http_responses",
            "Total count of responses by method, path and status codes",
            metrics.responses.clone(),
        )?;
        registry.register(
            "http_requests_duration_seconds",
            "Histogram of requests processing time by path (in seconds)",
            metrics.duration.clone(),
        )?;
        registry.register(
            "http_requests_duration_seconds_exemplar",
            "Histogram of requests processing time with trace exemplars (in seconds)",
            metrics.duration_exemplar.clone(),
        )?;
        registry.register(
            "http_exceptions",
            "Total count of exceptions raised by path and exception type",
            metrics.exceptions.clone(),
        )?;
        registry.register(
            "http_requests_in_progress",
            "Gauge of requests by method and path currently being processed",
            metrics.in_progress.clone(),
        )?;

        metrics
            .info
            .get_or_create(&AppLabels {
                app_name: app_name.to_string(),
            })
            .set(1);

        tracing::debug!(target: "observer.metrics", app_name, "HTTP metrics registered");
        Ok(metrics)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Count the request and raise the in-progress gauge.
    ///
    /// The gauge is lowered again when the returned guard drops, which
    /// also happens while unwinding from a panicking handler.
    #[must_use = "the in-progress gauge is lowered as soon as the guard drops"]
    pub fn track_in_flight(&self, labels: &RouteLabels) -> InFlightGuard {
        let gauge = self.in_progress.get_or_create(labels).clone();
        gauge.inc();
        self.requests.get_or_create(labels).inc();
        InFlightGuard { gauge }
    }

    /// Record the elapsed time into the labelled duration histogram.
    pub fn observe_duration(&self, labels: &RouteLabels, elapsed: Duration) {
        self.duration
            .get_or_create(labels)
            .observe(elapsed.as_secs_f64());
    }

    /// Record the elapsed time into the exemplar histogram.
    ///
    /// `exemplar` links the observation to a trace without adding a series.
    pub fn observe_duration_with_exemplar(
        &self,
        elapsed: Duration,
        exemplar: Option<ExemplarLabels>,
    ) {
        self.duration_exemplar
            .observe(elapsed.as_secs_f64(), exemplar);
    }

    /// Count a response with its status code.
    pub fn record_response(&self, labels: &RouteLabels, status_code: u16) {
        self.responses
            .get_or_create(&ResponseLabels {
                method: labels.method.clone(),
                path: labels.path.clone(),
                status_code: status_code.to_string(),
                app_name: labels.app_name.clone(),
            })
            .inc();
    }

    /// Count a failed response under its reason phrase.
    pub fn record_exception(&self, method: &str, path: &str, exception_type: &str) {
        self.exceptions
            .get_or_create(&ExceptionLabels {
                method: method.to_string(),
                path: path.to_string(),
                exception_type: exception_type.to_string(),
                app_name: self.app_name.clone(),
            })
            .inc();
    }

    // ------------------------------------------------------------------------
    // Read accessors
    //
    // Test-only: `get_or_create` materializes the series being read.
    // ------------------------------------------------------------------------

    #[cfg(any(test, feature = "test-utils"))]
    pub fn requests_total(&self, labels: &RouteLabels) -> u64 {
        self.requests.get_or_create(labels).get()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_progress(&self, labels: &RouteLabels) -> i64 {
        self.in_progress.get_or_create(labels).get()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn responses_total(&self, labels: &RouteLabels, status_code: u16) -> u64 {
        self.responses
            .get_or_create(&ResponseLabels {
                method: labels.method.clone(),
                path: labels.path.clone(),
                status_code: status_code.to_string(),
                app_name: labels.app_name.clone(),
            })
            .get()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn exceptions_total(&self, method: &str, path: &str, exception_type: &str) -> u64 {
        self.exceptions
            .get_or_create(&ExceptionLabels {
                method: method.to_string(),
                path: path.to_string(),
                exception_type: exception_type.to_string(),
                app_name: self.app_name.clone(),
            })
            .get()
    }
}

/// Lowers the in-progress gauge for one request when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    gauge: Gauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
