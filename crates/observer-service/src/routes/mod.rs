//! HTTP routes for the observer service.
//!
//! Axum only does path matching here. Every registered template is mounted
//! with `any(dispatch)`, unmatched paths go to the fallback, and
//! [`dispatch`] hands the buffered request to the synchronous handler chain
//! `ExceptionCounter(TraceMetrics(RouteTable))` on a blocking worker.

use crate::config::Config;
use crate::errors::ServiceError;
use crate::handlers::{self, demo};
use crate::middleware::exceptions::ExceptionCounter;
use crate::middleware::sink::{http_error, BufferedResponse, Handler, HttpRequest, ResponseSink};
use crate::middleware::span::{MatchedRoute, SharedPropagator};
use crate::middleware::trace_metrics::TraceMetricsBuilder;
use crate::observability::metrics::{HttpMetrics, MetricsRegistry};
use axum::{
    body::Bytes,
    extract::{MatchedPath, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http_body_util::LengthLimitError;
use opentelemetry::trace::Tracer;
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Largest request body `dispatch` will buffer.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Marks a request whose body `dispatch` could not buffer.
///
/// The request still runs through the chain with an empty body and
/// [`RouteTable`] answers it, so it is traced and counted like any other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectedBody {
    /// Body exceeded [`MAX_BODY_BYTES`].
    TooLarge,
    /// Body stream failed.
    Unreadable,
}

impl RejectedBody {
    fn classify(error: &axum::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(err) = source {
            if err.is::<LengthLimitError>() {
                return Self::TooLarge;
            }
            source = err.source();
        }
        Self::Unreadable
    }

    fn into_error(self) -> ServiceError {
        match self {
            Self::TooLarge => ServiceError::PayloadTooLarge(MAX_BODY_BYTES),
            Self::Unreadable => ServiceError::BadRequest("Request body unreadable".to_string()),
        }
    }
}

/// One registered (method, template) pair.
pub struct Route {
    method: Method,
    template: String,
    handler: Box<dyn Handler>,
}

impl Route {
    pub fn new(method: Method, template: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self {
            method,
            template: template.into(),
            handler: Box::new(handler),
        }
    }

    pub fn get(template: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(Method::GET, template, handler)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

/// Innermost handler: picks the route by matched template and method.
///
/// An unknown path is answered with 404, a known path with the wrong
/// method with 405, and a [`RejectedBody`] with 413 or 400.
#[derive(Clone, Debug)]
pub struct RouteTable {
    routes: Arc<Vec<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: Arc::new(routes),
        }
    }

    /// Distinct templates in registration order.
    pub fn templates(&self) -> Vec<String> {
        let mut templates: Vec<String> = Vec::new();
        for route in self.routes.iter() {
            if !templates.contains(&route.template) {
                templates.push(route.template.clone());
            }
        }
        templates
    }

    /// Whether `method` is served on `template`.
    pub fn allows(&self, template: &str, method: &Method) -> bool {
        self.routes
            .iter()
            .any(|route| route.template == template && route.method == *method)
    }

    fn allowed_methods(&self, template: &str) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|route| route.template == template)
            .map(|route| route.method.as_str())
            .collect()
    }
}

impl Handler for RouteTable {
    fn serve(&self, w: &mut dyn ResponseSink, request: HttpRequest) {
        if let Some(rejected) = request.extensions().get::<RejectedBody>() {
            return rejected.into_error().write_to(w);
        }

        let Some(template) = request
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_owned())
        else {
            return http_error(w, "404 page not found", StatusCode::NOT_FOUND);
        };

        let route = self
            .routes
            .iter()
            .find(|route| route.template == template && route.method == request.method());
        if let Some(route) = route {
            return route.handler.serve(w, request);
        }

        let allowed = self.allowed_methods(&template);
        if allowed.is_empty() {
            return http_error(w, "404 page not found", StatusCode::NOT_FOUND);
        }
        if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
            w.headers_mut().insert(header::ALLOW, value);
        }
        http_error(w, "Method Not Allowed", StatusCode::METHOD_NOT_ALLOWED);
    }
}

/// Routes served by the observer service.
pub fn service_routes(registry: Arc<MetricsRegistry>) -> RouteTable {
    RouteTable::new(vec![
        Route::get("/metrics", handlers::metrics_handler(registry)),
        Route::get("/health", handlers::health_check),
        Route::get("/", demo::hello_world),
        Route::get("/io_task", demo::io_task),
        Route::get("/cpu_task", demo::cpu_task),
        Route::get("/random_status", demo::random_status),
        Route::get("/random_sleep", demo::random_sleep),
        Route::get("/error_test", demo::error_test),
    ])
}

/// Wrap `routes` in the observability chain.
pub fn build_chain<T>(
    config: &Config,
    metrics: Arc<HttpMetrics>,
    tracer: T,
    propagator: SharedPropagator,
    routes: RouteTable,
) -> Arc<dyn Handler>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let traced = TraceMetricsBuilder::new(config.app_name.clone())
        .tracer(tracer)
        .propagator(propagator)
        .public_endpoint(config.public_endpoint)
        .build(Arc::clone(&metrics), routes);

    Arc::new(ExceptionCounter::new(metrics, traced))
}

/// Application state shared across all requests.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Registry backing `/metrics`.
    pub registry: Arc<MetricsRegistry>,

    /// Handles to the HTTP metrics updated by the chain.
    pub metrics: Arc<HttpMetrics>,

    /// Route table, consulted by `dispatch` before publishing the match.
    pub routes: RouteTable,

    /// The full handler chain.
    pub chain: Arc<dyn Handler>,
}

impl AppState {
    /// Assemble the state from a fully registered `registry`.
    pub fn new<T>(
        config: Config,
        registry: MetricsRegistry,
        metrics: HttpMetrics,
        tracer: T,
        propagator: SharedPropagator,
    ) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        let registry = Arc::new(registry);
        let metrics = Arc::new(metrics);
        let routes = service_routes(Arc::clone(&registry));
        let chain = build_chain(
            &config,
            Arc::clone(&metrics),
            tracer,
            propagator,
            routes.clone(),
        );

        Self {
            config,
            registry,
            metrics,
            routes,
            chain,
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Axum entry point for every request.
///
/// Buffers the body, publishes the matched route (only when the method is
/// served there), and runs the chain on a blocking worker. A body that
/// cannot be buffered is replaced by a [`RejectedBody`] marker.
pub async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            let rejected = RejectedBody::classify(&e);
            tracing::warn!(target: "observer.http", error = %e, ?rejected, "Request body rejected");
            parts.extensions.insert(rejected);
            Bytes::new()
        }
    };

    let template = parts
        .extensions
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned());
    if let Some(template) = template {
        if state.routes.allows(&template, &parts.method) {
            parts
                .extensions
                .insert(MatchedRoute::from_template(template));
        }
    }

    let request = HttpRequest::from_parts(parts, body);
    let chain = Arc::clone(&state.chain);
    let served = tokio::task::spawn_blocking(move || {
        let mut sink = BufferedResponse::new();
        chain.serve(&mut sink, request);
        sink
    })
    .await;

    match served {
        Ok(sink) => sink.into_response(),
        Err(e) => {
            tracing::error!(target: "observer.http", error = %e, "Handler chain failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - every route in [`AppState::routes`], dispatched through the chain
/// - a fallback that sends unmatched paths through the same chain
/// - TraceLayer for request logging
///
/// There is no timeout layer. A handler runs to completion on its blocking
/// worker, so the status recorded by the chain is always the one the client
/// receives.
pub fn build_routes(state: Arc<AppState>) -> Router {
    let mut router = Router::new();
    for template in state.routes.templates() {
        router = router.route(&template, any(dispatch));
    }

    router
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::observability::metrics::RouteLabels;
    use crate::observability::testing::{sample_value, InMemoryTracing};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_state() -> (Arc<AppState>, InMemoryTracing) {
        let config = Config::from_vars(&HashMap::from([(
            "APP_NAME".to_string(),
            "test-app".to_string(),
        )]))
        .unwrap();
        let mut registry = MetricsRegistry::new();
        let metrics = HttpMetrics::register(&mut registry, "test-app").unwrap();
        let tracing = InMemoryTracing::new();
        let state = AppState::new(
            config,
            registry,
            metrics,
            tracing.tracer(),
            Arc::new(TraceContextPropagator::new()),
        );
        (Arc::new(state), tracing)
    }

    async fn call(state: &Arc<AppState>, method: Method, uri: &str) -> (StatusCode, String) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = build_routes(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn test_templates_are_distinct() {
        let table = RouteTable::new(vec![
            Route::get("/a", handlers::health_check),
            Route::new(Method::POST, "/a", handlers::health_check),
            Route::get("/b", handlers::health_check),
        ]);

        assert_eq!(table.templates(), vec!["/a".to_string(), "/b".to_string()]);
        assert!(table.allows("/a", &Method::POST));
        assert!(!table.allows("/b", &Method::POST));
    }

    #[tokio::test]
    async fn test_health_route() {
        let (state, tracing) = test_state();

        let (status, body) = call(&state, Method::GET, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\"status\":\"OK\"}\n");
        let labels = RouteLabels::new("GET", "/health", "test-app");
        assert_eq!(state.metrics.responses_total(&labels, 200), 1);
        assert_eq!(state.metrics.in_progress(&labels), 0);
        assert_eq!(tracing.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_path_uses_fallback_label() {
        let (state, _tracing) = test_state();

        let (status, _body) = call(&state, Method::GET, "/xyz").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        let labels = RouteLabels::new("GET", "HTTP GET route not found", "test-app");
        assert_eq!(state.metrics.responses_total(&labels, 404), 1);
        assert_eq!(
            state
                .metrics
                .exceptions_total("GET", "HTTP GET route not found", "Not Found"),
            1
        );
    }

    #[tokio::test]
    async fn test_wrong_method_is_405_without_route_label() {
        let (state, _tracing) = test_state();

        let (status, _body) = call(&state, Method::POST, "/health").await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let labels = RouteLabels::new("POST", "HTTP POST route not found", "test-app");
        assert_eq!(state.metrics.responses_total(&labels, 405), 1);
    }

    #[tokio::test]
    async fn test_error_route_counts_exception() {
        let (state, _tracing) = test_state();

        let (status, body) = call(&state, Method::GET, "/error_test").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "got error!!!!\n");
        assert_eq!(
            state
                .metrics
                .exceptions_total("GET", "/error_test", "Internal Server Error"),
            1
        );
    }

    #[tokio::test]
    async fn test_oversized_body_is_answered_through_the_chain() {
        let (state, tracing) = test_state();
        let request = axum::http::Request::builder()
            .method(Method::GET)
            .uri("/health")
            .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
            .unwrap();

        let response = build_routes(Arc::clone(&state)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let labels = RouteLabels::new("GET", "/health", "test-app");
        assert_eq!(state.metrics.requests_total(&labels), 1);
        assert_eq!(state.metrics.responses_total(&labels, 413), 1);
        assert_eq!(state.metrics.in_progress(&labels), 0);
        assert_eq!(
            state
                .metrics
                .exceptions_total("GET", "/health", "Payload Too Large"),
            1
        );
        assert_eq!(tracing.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_body_classification() {
        let too_large = axum::body::to_bytes(Body::from(vec![0u8; 16]), 8)
            .await
            .unwrap_err();
        let broken = axum::Error::new(std::io::Error::other("connection reset"));

        assert_eq!(RejectedBody::classify(&too_large), RejectedBody::TooLarge);
        assert_eq!(RejectedBody::classify(&broken), RejectedBody::Unreadable);
    }

    #[test]
    fn test_unreadable_body_is_bad_request() {
        let table = service_routes(Arc::new(MetricsRegistry::new()));
        let mut request = HttpRequest::new(Bytes::new());
        request.extensions_mut().insert(RejectedBody::Unreadable);

        let mut sink = BufferedResponse::new();
        table.serve(&mut sink, request);

        assert_eq!(sink.committed_status(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_slow_handler_status_matches_recorded_status() {
        let (base, _tracing) = test_state();
        let routes = RouteTable::new(vec![Route::get(
            "/slow",
            |w: &mut dyn ResponseSink, _req: HttpRequest| {
                std::thread::sleep(std::time::Duration::from_millis(1200));
                w.write_header(StatusCode::OK);
            },
        )]);
        let tracing = InMemoryTracing::new();
        let chain = build_chain(
            &base.config,
            Arc::clone(&base.metrics),
            tracing.tracer(),
            Arc::new(TraceContextPropagator::new()),
            routes.clone(),
        );
        let state = Arc::new(AppState {
            config: base.config.clone(),
            registry: Arc::clone(&base.registry),
            metrics: Arc::clone(&base.metrics),
            routes,
            chain,
        });

        let (status, _body) = call(&state, Method::GET, "/slow").await;

        assert_eq!(status, StatusCode::OK);
        let labels = RouteLabels::new("GET", "/slow", "test-app");
        assert_eq!(state.metrics.responses_total(&labels, 200), 1);
        assert_eq!(state.metrics.responses_total(&labels, 408), 0);
        assert_eq!(
            state
                .metrics
                .exceptions_total("GET", "/slow", "Request Timeout"),
            0
        );
    }

    #[tokio::test]
    async fn test_metrics_route_reflects_previous_requests() {
        let (state, _tracing) = test_state();

        call(&state, Method::GET, "/health").await;
        let (status, text) = call(&state, Method::GET, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            sample_value(
                &text,
                "http_requests_total{method=\"GET\",path=\"/health\",app_name=\"test-app\"}"
            ),
            Some(1.0)
        );
    }
}
