//! HTTP request handlers for the observer service.
//!
//! Handlers are synchronous and write straight to a [`ResponseSink`], so the
//! middleware chain sees every status commit and body write.
//!
//! [`ResponseSink`]: crate::middleware::sink::ResponseSink

pub mod demo;
pub mod health;
pub mod metrics;

pub use health::health_check;
pub use metrics::metrics_handler;
