//! HTTP observability middleware.
//!
//! # Components
//!
//! - `sink` - Response sink and handler capability the chain is built from
//! - `status_writer` - Status-capturing writer and its object pool
//! - `span` - Server span lifecycle and route label resolution
//! - `trace_metrics` - Tracing + metrics middleware
//! - `exceptions` - Outermost exception-counting wrapper
//!
//! The chain used by the server is
//! `ExceptionCounter(TraceMetrics(RouteTable))`.

pub mod exceptions;
pub mod sink;
pub mod span;
pub mod status_writer;
pub mod trace_metrics;

pub use exceptions::ExceptionCounter;
pub use sink::{BufferedResponse, Handler, HttpRequest, ResponseSink};
pub use span::{MatchedRoute, RouteLabel, SpanManager};
pub use status_writer::{FreshWriters, SharedWriterPool, StatusWriter, WriterPool};
pub use trace_metrics::{TraceMetrics, TraceMetricsBuilder};
