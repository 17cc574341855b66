//! Span lifecycle for inbound requests.
//!
//! [`SpanManager::start`] extracts the propagated parent, resolves the route
//! label, and starts a server span. It then binds the span's context into
//! the request extensions so the handler can continue the trace.
//! [`SpanManager::finish`] consumes the [`RequestSpan`], so a span can only
//! be ended once.
//!
//! # Route labels
//!
//! The route comes from the router's [`MatchedRoute`] extension: the path
//! template first, then the path pattern. When neither is available, the label
//! becomes `"HTTP <METHOD> route not found"`. Raw paths never become labels.
//!
//! # Public endpoints
//!
//! A public endpoint always starts a new trace. A valid remote parent is kept
//! as a span link, so the caller stays correlated without their trace
//! growing into ours.

use super::sink::HttpRequest;
use axum::extract::ConnectInfo;
use axum::http::{header, uri::Authority, HeaderMap, HeaderName, Method, StatusCode, Version};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{Link, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_semantic_conventions::trace as semconv;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Formats the span name from the route label and the request.
pub type SpanNameFormatter = Arc<dyn Fn(&str, &HttpRequest) -> String + Send + Sync>;

/// Per-request public-endpoint decision.
pub type PublicEndpointFn = Arc<dyn Fn(&HttpRequest) -> bool + Send + Sync>;

/// Shared text-map propagator handle.
pub type SharedPropagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// Route match published by the router for the current request.
///
/// Absence of this extension means the router found no match. That is a
/// normal outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedRoute {
    template: Option<String>,
    pattern: Option<String>,
}

impl MatchedRoute {
    /// Route matched by a path template such as `/users/:id`.
    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            pattern: None,
        }
    }

    /// Route matched by a path pattern (e.g. a regular expression) only.
    pub fn from_pattern(pattern: impl Into<String>) -> Self {
        Self {
            template: None,
            pattern: Some(pattern.into()),
        }
    }

    pub fn path_template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn path_pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }
}

/// Route label used for span names and metric labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteLabel {
    /// A route template or pattern resolved by the router.
    Matched(String),
    /// Synthesized `"HTTP <METHOD> route not found"` marker.
    NotFound(String),
}

impl RouteLabel {
    /// Resolve the label: template, then pattern, then the not-found marker.
    pub fn resolve(method: &Method, route: Option<&MatchedRoute>) -> Self {
        let resolved = route.and_then(|r| {
            r.path_template()
                .filter(|t| !t.is_empty())
                .or_else(|| r.path_pattern().filter(|p| !p.is_empty()))
        });

        match resolved {
            Some(route) => RouteLabel::Matched(route.to_string()),
            None => RouteLabel::NotFound(route_not_found(method)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RouteLabel::Matched(route) | RouteLabel::NotFound(route) => route,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, RouteLabel::Matched(_))
    }
}

impl fmt::Display for RouteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fallback label for requests the router did not match.
pub fn route_not_found(method: &Method) -> String {
    format!("HTTP {} route not found", method)
}

/// Default span name: the route label itself.
pub fn default_span_name(route: &str, _request: &HttpRequest) -> String {
    route.to_string()
}

/// Map a response status to a server span status.
///
/// 1xx to 4xx leave the status unset (client errors are not server errors),
/// 5xx is an error, and anything outside 100..=599 is an invalid-code error.
pub fn server_span_status(status: StatusCode) -> Status {
    match status.as_u16() {
        100..=499 => Status::Unset,
        500..=599 => Status::error(""),
        code => Status::error(format!("Invalid HTTP status code {}", code)),
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// A started server span plus the route label it was started with.
#[derive(Debug)]
pub struct RequestSpan {
    cx: Context,
    route: RouteLabel,
}

impl RequestSpan {
    /// Context carrying the active server span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn route(&self) -> &RouteLabel {
        &self.route
    }

    /// Hex trace and span ids, if the span context is valid.
    pub fn ids(&self) -> Option<(String, String)> {
        let span = self.cx.span();
        let sc = span.span_context();
        sc.is_valid()
            .then(|| (sc.trace_id().to_string(), sc.span_id().to_string()))
    }
}

/// Starts and finishes server spans.
pub struct SpanManager<T> {
    service: String,
    tracer: T,
    propagator: SharedPropagator,
    span_name: SpanNameFormatter,
    public_endpoint: bool,
    public_endpoint_fn: Option<PublicEndpointFn>,
}

impl<T> SpanManager<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Manager with the W3C trace-context propagator and the route label as
    /// span name.
    pub fn new(service: impl Into<String>, tracer: T) -> Self {
        Self {
            service: service.into(),
            tracer,
            propagator: Arc::new(TraceContextPropagator::new()),
            span_name: Arc::new(default_span_name),
            public_endpoint: false,
            public_endpoint_fn: None,
        }
    }

    pub fn with_propagator(mut self, propagator: SharedPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_span_name_formatter(mut self, formatter: SpanNameFormatter) -> Self {
        self.span_name = formatter;
        self
    }

    pub fn with_public_endpoint(mut self, public: bool) -> Self {
        self.public_endpoint = public;
        self
    }

    pub fn with_public_endpoint_fn(mut self, predicate: PublicEndpointFn) -> Self {
        self.public_endpoint_fn = Some(predicate);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Start the server span for `request`.
    ///
    /// Leaves the span's context in the request extensions.
    pub fn start(&self, request: &mut HttpRequest) -> RequestSpan {
        let parent_cx = self
            .propagator
            .extract_with_context(&Context::new(), &HeaderExtractor(request.headers()));

        let route = RouteLabel::resolve(request.method(), request.extensions().get::<MatchedRoute>());

        let mut attributes = server_request_attributes(&self.service, request);
        if let RouteLabel::Matched(template) = &route {
            attributes.push(KeyValue::new(semconv::HTTP_ROUTE, template.clone()));
        }

        // The predicate sees the extracted parent, as a handler would
        request.extensions_mut().insert(parent_cx.clone());
        let public = self.public_endpoint
            || self
                .public_endpoint_fn
                .as_ref()
                .is_some_and(|predicate| predicate(request));

        let mut links = Vec::new();
        let start_cx = if public {
            let remote = parent_cx.span().span_context().clone();
            if remote.is_valid() && remote.is_remote() {
                links.push(Link::with_context(remote));
            }
            Context::new()
        } else {
            parent_cx.clone()
        };

        let name = (self.span_name)(route.as_str(), request);
        let builder = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .with_links(links);
        let span = self.tracer.build_with_context(builder, &start_cx);

        let cx = parent_cx.with_span(span);
        request.extensions_mut().insert(cx.clone());

        RequestSpan { cx, route }
    }

    /// Record the observed status on the span and end it.
    pub fn finish(&self, request_span: RequestSpan, status: StatusCode) {
        let span = request_span.cx.span();
        span.set_attribute(KeyValue::new(
            semconv::HTTP_RESPONSE_STATUS_CODE,
            i64::from(status.as_u16()),
        ));
        span.set_status(server_span_status(status));
        span.end();
    }
}

impl<T> fmt::Debug for SpanManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanManager")
            .field("service", &self.service)
            .field("propagator", &self.propagator)
            .field("public_endpoint", &self.public_endpoint)
            .field("public_endpoint_fn", &self.public_endpoint_fn.is_some())
            .finish_non_exhaustive()
    }
}

/// Standard HTTP server request attributes.
fn server_request_attributes(service: &str, request: &HttpRequest) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(
            semconv::HTTP_REQUEST_METHOD,
            request.method().as_str().to_string(),
        ),
        KeyValue::new(
            semconv::URL_SCHEME,
            request.uri().scheme_str().unwrap_or("http").to_string(),
        ),
        KeyValue::new(semconv::URL_PATH, request.uri().path().to_string()),
    ];

    let authority = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|host| host.parse::<Authority>().ok())
        .or_else(|| request.uri().authority().cloned());

    let server_address = if service.is_empty() {
        authority.as_ref().map(|a| a.host().to_string())
    } else {
        Some(service.to_string())
    };
    if let Some(address) = server_address {
        attributes.push(KeyValue::new(semconv::SERVER_ADDRESS, address));
    }
    if let Some(port) = authority.as_ref().and_then(Authority::port_u16) {
        attributes.push(KeyValue::new(semconv::SERVER_PORT, i64::from(port)));
    }

    if let Some(agent) = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        attributes.push(KeyValue::new(
            semconv::USER_AGENT_ORIGINAL,
            agent.to_string(),
        ));
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    if let Some(addr) = peer {
        attributes.push(KeyValue::new(
            semconv::NETWORK_PEER_ADDRESS,
            addr.ip().to_string(),
        ));
        attributes.push(KeyValue::new(
            semconv::NETWORK_PEER_PORT,
            i64::from(addr.port()),
        ));
    }

    // First X-Forwarded-For hop is the original client
    let forwarded_client = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|client| !client.is_empty())
        .map(str::to_string);
    if let Some(client) = forwarded_client.or_else(|| peer.map(|addr| addr.ip().to_string())) {
        attributes.push(KeyValue::new(semconv::CLIENT_ADDRESS, client));
    }

    let protocol = match request.version() {
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    };
    if let Some(version) = protocol {
        attributes.push(KeyValue::new(semconv::NETWORK_PROTOCOL_VERSION, version));
    }

    attributes
}
