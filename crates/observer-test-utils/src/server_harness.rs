//! Test server harness for E2E testing
//!
//! Provides `TestObserverServer` for spawning real observer service instances
//! in tests. Spans go to an in-memory exporter so tests can inspect them.

use observer_service::config::Config;
use observer_service::observability::metrics::{HttpMetrics, MetricsRegistry};
use observer_service::observability::testing::InMemoryTracing;
use observer_service::routes::{self, AppState};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// App name used by the harness unless overridden.
pub const TEST_APP_NAME: &str = "test-app";

/// Test harness for spawning the observer service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_flow_e2e() -> Result<(), anyhow::Error> {
///     let server = TestObserverServer::spawn().await?;
///     let client = reqwest::Client::new();
///
///     let response = client
///         .get(&format!("{}/health", server.url()))
///         .send()
///         .await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestObserverServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    tracing: InMemoryTracing,
    _handle: JoinHandle<()>,
}

impl TestObserverServer {
    /// Spawn a server with default test configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(HashMap::new()).await
    }

    /// Spawn a server with extra environment-style configuration.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Register metrics into a registry private to this instance
    /// - Record spans in memory instead of exporting them
    pub async fn spawn_with(overrides: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("APP_NAME".to_string(), TEST_APP_NAME.to_string()),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ]);
        vars.extend(overrides);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let mut registry = MetricsRegistry::new();
        let metrics = HttpMetrics::register(&mut registry, &config.app_name)
            .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?;

        let tracing = InMemoryTracing::new();
        let state = Arc::new(AppState::new(
            config,
            registry,
            metrics,
            tracing.tracer(),
            Arc::new(TraceContextPropagator::new()),
        ));

        // Build routes using observer-service's real route builder
        let app = routes::build_routes(Arc::clone(&state));

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            // Use into_make_service_with_connect_info to support SocketAddr extraction
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            tracing,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared application state (metrics handles, registry, config).
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Current exposition text, read straight from the registry.
    pub fn scrape(&self) -> Result<String, anyhow::Error> {
        self.state
            .registry
            .encode()
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }

    /// Spans that have ended so far.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.tracing.finished_spans()
    }
}

impl Drop for TestObserverServer {
    fn drop(&mut self) {
        // Explicitly abort the HTTP server task to ensure immediate cleanup
        // when the test completes.
        self._handle.abort();
    }
}
