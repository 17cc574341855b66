//! Observability integration tests.
//!
//! Drives real HTTP requests through the middleware chain and checks the
//! resulting metrics exposition and finished spans.

use futures::future::join_all;
use observer_test_utils::{count_series, sample_value, TestObserverServer};
use opentelemetry::trace::{SpanId, TraceId};

const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

/// A successful request is counted once and the gauge nets to zero.
#[tokio::test]
async fn test_health_request_metrics() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;

    let response = reqwest::get(format!("{}/health", server.url())).await?;
    assert_eq!(response.status(), 200);

    let text = server.scrape()?;
    assert_eq!(
        sample_value(
            &text,
            "http_requests_total{method=\"GET\",path=\"/health\",app_name=\"test-app\"}"
        ),
        Some(1.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "http_responses_total{method=\"GET\",path=\"/health\",status_code=\"200\",app_name=\"test-app\"}"
        ),
        Some(1.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "http_requests_in_progress{method=\"GET\",path=\"/health\",app_name=\"test-app\"}"
        ),
        Some(0.0)
    );

    Ok(())
}

/// A 500 is counted as an exception and labelled on the response counter.
#[tokio::test]
async fn test_error_endpoint_counts_exception() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;

    let response = reqwest::get(format!("{}/error_test", server.url())).await?;
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await?, "got error!!!!\n");

    let text = server.scrape()?;
    assert_eq!(
        sample_value(
            &text,
            "http_exceptions_total{method=\"GET\",path=\"/error_test\",exception_type=\"Internal Server Error\",app_name=\"test-app\"}"
        ),
        Some(1.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "http_responses_total{method=\"GET\",path=\"/error_test\",status_code=\"500\",app_name=\"test-app\"}"
        ),
        Some(1.0)
    );

    Ok(())
}

/// Unmatched paths collapse onto a single route-not-found series.
#[tokio::test]
async fn test_unmatched_paths_do_not_create_series() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;

    for path in ["/xyz", "/abc", "/xyz/1", "/xyz/2"] {
        let response = reqwest::get(format!("{}{}", server.url(), path)).await?;
        assert_eq!(response.status(), 404);
    }

    let text = server.scrape()?;
    assert_eq!(
        sample_value(
            &text,
            "http_requests_total{method=\"GET\",path=\"HTTP GET route not found\",app_name=\"test-app\"}"
        ),
        Some(4.0)
    );
    assert_eq!(count_series(&text, "http_requests_total", "/xyz"), 0);
    assert_eq!(count_series(&text, "http_exceptions_total", "/xyz"), 0);

    let spans = server.finished_spans();
    assert_eq!(spans.len(), 4);
    assert!(spans.iter().all(|s| s.name == "HTTP GET route not found"));

    Ok(())
}

/// Fifty concurrent requests are counted exactly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_counted_exactly() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;
    let client = reqwest::Client::new();
    let url = format!("{}/cpu_task", server.url());

    let responses = join_all((0..50).map(|_| client.get(&url).send())).await;
    for response in responses {
        assert_eq!(response?.status(), 200);
    }

    let text = server.scrape()?;
    assert_eq!(
        sample_value(
            &text,
            "http_requests_total{method=\"GET\",path=\"/cpu_task\",app_name=\"test-app\"}"
        ),
        Some(50.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "http_responses_total{method=\"GET\",path=\"/cpu_task\",status_code=\"200\",app_name=\"test-app\"}"
        ),
        Some(50.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "http_requests_in_progress{method=\"GET\",path=\"/cpu_task\",app_name=\"test-app\"}"
        ),
        Some(0.0)
    );

    Ok(())
}

/// The /metrics endpoint serves OpenMetrics with exemplars linked to spans.
#[tokio::test]
async fn test_metrics_endpoint_serves_exemplars() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;

    reqwest::get(format!("{}/", server.url())).await?;
    let response = reqwest::get(format!("{}/metrics", server.url())).await?;
    assert_eq!(response.status(), 200);

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(
        content_type.as_deref(),
        Some("application/openmetrics-text; version=1.0.0; charset=utf-8")
    );

    let text = response.text().await?;
    assert!(text.contains("app_info{app_name=\"test-app\"} 1"));

    let root_span = server
        .finished_spans()
        .into_iter()
        .find(|s| s.name == "/")
        .ok_or_else(|| anyhow::anyhow!("no span for /"))?;
    let trace_id = root_span.span_context.trace_id().to_string();
    assert!(
        text.lines()
            .any(|line| line.starts_with("http_requests_duration_seconds_exemplar_bucket")
                && line.contains(&format!("trace_id=\"{}\"", trace_id))),
        "no exemplar for trace {} in:\n{}",
        trace_id,
        text
    );

    Ok(())
}

/// An inbound traceparent is continued by the server span.
#[tokio::test]
async fn test_traceparent_is_continued() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn().await?;
    let client = reqwest::Client::new();

    client
        .get(format!("{}/health", server.url()))
        .header("traceparent", TRACEPARENT)
        .send()
        .await?;

    let spans = server.finished_spans();
    let span = spans
        .iter()
        .find(|s| s.name == "/health")
        .ok_or_else(|| anyhow::anyhow!("no span for /health"))?;
    assert_eq!(
        span.span_context.trace_id(),
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736")?
    );
    assert_eq!(span.parent_span_id, SpanId::from_hex("00f067aa0ba902b7")?);

    Ok(())
}

/// With PUBLIC_ENDPOINT set, the caller's trace is linked, not continued.
#[tokio::test]
async fn test_public_endpoint_links_caller_trace() -> Result<(), anyhow::Error> {
    let server = TestObserverServer::spawn_with(
        [("PUBLIC_ENDPOINT".to_string(), "true".to_string())].into(),
    )
    .await?;
    let client = reqwest::Client::new();

    client
        .get(format!("{}/health", server.url()))
        .header("traceparent", TRACEPARENT)
        .send()
        .await?;

    let remote = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736")?;
    let spans = server.finished_spans();
    let span = spans
        .iter()
        .find(|s| s.name == "/health")
        .ok_or_else(|| anyhow::anyhow!("no span for /health"))?;
    assert_ne!(span.span_context.trace_id(), remote);
    assert!(span
        .links
        .links
        .iter()
        .any(|link| link.span_context.trace_id() == remote));

    Ok(())
}
