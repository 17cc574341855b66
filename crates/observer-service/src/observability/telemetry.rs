//! Trace pipeline setup.
//!
//! Builds the SDK tracer provider (with an OTLP/gRPC batch exporter when an
//! endpoint is configured) and the text-map propagator used for inbound
//! context extraction.

use crate::config::Config;
use crate::errors::ServiceError;
use crate::middleware::span::SharedPropagator;
use opentelemetry::global;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use std::sync::Arc;

/// Build the tracer provider and install it globally.
///
/// Without an OTLP endpoint spans are still created and sampled, so trace
/// ids reach logs and exemplars, but nothing is exported.
///
/// # Errors
///
/// Returns [`ServiceError::TraceExporter`] if the exporter cannot be built.
pub fn init_tracer_provider(config: &Config) -> Result<TracerProvider, ServiceError> {
    let mut builder = TracerProvider::builder().with_resource(Resource::new(vec![
        KeyValue::new(SERVICE_NAME, config.app_name.clone()),
    ]));

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .map_err(|e| ServiceError::TraceExporter(e.to_string()))?;
            builder = builder.with_batch_exporter(exporter, runtime::Tokio);
            tracing::info!(target: "observer.telemetry", "OTLP trace export enabled");
        }
        None => {
            tracing::info!(
                target: "observer.telemetry",
                "OTEL_EXPORTER_OTLP_ENDPOINT not set, traces are not exported"
            );
        }
    }

    let provider = builder.build();
    let _previous = global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// W3C trace-context plus baggage.
pub fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Install the composite propagator globally and return a handle for the
/// middleware.
pub fn install_propagator() -> SharedPropagator {
    global::set_text_map_propagator(composite_propagator());
    Arc::new(composite_propagator())
}

/// Flush pending spans and stop the exporter.
pub fn shutdown_tracer_provider(provider: &TracerProvider) {
    if let Err(e) = provider.shutdown() {
        tracing::warn!(target: "observer.telemetry", error = %e, "Tracer provider shutdown failed");
    }
}
