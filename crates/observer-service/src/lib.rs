//! Observer Service Library
//!
//! An HTTP service whose every request passes through an observability
//! middleware chain:
//!
//! - a server span per request, continuing or linking the caller's trace
//! - request, response, in-progress and latency metrics, with trace-linked
//!   exemplars on the latency histogram
//! - an exception counter for every response with status >= 400
//!
//! # Architecture
//!
//! ```text
//! routes::dispatch -> ExceptionCounter -> TraceMetrics -> RouteTable -> handlers/*.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Response sink, status capture, spans, metrics chain
//! - `models` - Data models
//! - `observability` - Metrics registry, trace pipeline, log correlation
//! - `routes` - Axum router, route table and chain assembly

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
