//! Observer Service
//!
//! Demo HTTP service instrumented with distributed tracing and
//! Prometheus/OpenMetrics metrics.

use observer_service::config::Config;
use observer_service::middleware::trace_metrics::TRACER_NAME;
use observer_service::observability::metrics::{HttpMetrics, MetricsRegistry};
use observer_service::observability::telemetry;
use observer_service::routes::{self, AppState};
use opentelemetry::trace::TracerProvider as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "observer_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Observer Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        app_name = %config.app_name,
        bind_address = %config.bind_address,
        public_endpoint = config.public_endpoint,
        drain_seconds = config.drain_seconds,
        "Configuration loaded successfully"
    );

    // Register metrics once; a duplicate name is a fatal configuration error
    let mut registry = MetricsRegistry::new();
    let metrics = HttpMetrics::register(&mut registry, &config.app_name).map_err(|e| {
        error!("Failed to register metrics: {}", e);
        e
    })?;

    // Trace pipeline
    let provider = telemetry::init_tracer_provider(&config).map_err(|e| {
        error!("Failed to initialize tracing: {}", e);
        e
    })?;
    let propagator = telemetry::install_propagator();
    let tracer = provider.tracer(TRACER_NAME);

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;

    // Create application state
    let state = Arc::new(AppState::new(config, registry, metrics, tracer, propagator));

    // Build application routes
    let app = routes::build_routes(state);

    // Parse bind address
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Observer Service listening on {}", addr);

    // Start server with graceful shutdown support
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(drain_seconds))
    .await?;

    telemetry::shutdown_tracer_provider(&provider);
    info!("Observer Service shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and drain period is complete.
async fn shutdown_signal(drain_secs: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    if drain_secs > 0 {
        warn!("Draining connections for {} seconds...", drain_secs);
        tokio::time::sleep(Duration::from_secs(drain_secs)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (DRAIN_SECONDS=0)");
    }
}
