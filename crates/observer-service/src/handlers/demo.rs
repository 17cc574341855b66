//! Demo business handlers.
//!
//! Small endpoints with different latency and failure profiles, useful for
//! exercising dashboards and trace views. Each logs with the request's
//! trace and span ids so logs can be joined to traces.

use crate::middleware::sink::{http_error, write_json, write_text, HttpRequest, ResponseSink};
use crate::models::HealthResponse;
use crate::observability::request_log_fields;
use axum::http::StatusCode;
use rand::seq::SliceRandom;
use rand::Rng;
use std::hint::black_box;
use std::thread;
use std::time::Duration;

/// Simulated I/O wait for `/io_task`.
pub const IO_TASK_DELAY: Duration = Duration::from_secs(2);

/// Upper bound (exclusive) of the `/random_sleep` delay in seconds.
pub const MAX_RANDOM_SLEEP_SECONDS: u64 = 10;

/// Statuses `/random_status` picks from.
pub const RANDOM_STATUSES: [StatusCode; 4] = [
    StatusCode::OK,
    StatusCode::BAD_REQUEST,
    StatusCode::NOT_FOUND,
    StatusCode::INTERNAL_SERVER_ERROR,
];

/// GET /
pub fn hello_world(w: &mut dyn ResponseSink, request: HttpRequest) {
    let ids = request_log_fields(&request);
    tracing::info!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/",
        "Hello World"
    );
    write_text(w, StatusCode::OK, "Hello World");
}

/// GET /io_task
pub fn io_task(w: &mut dyn ResponseSink, request: HttpRequest) {
    thread::sleep(IO_TASK_DELAY);
    write_text(w, StatusCode::OK, "IO bound task finish!");

    let ids = request_log_fields(&request);
    tracing::warn!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/io_task",
        "io task"
    );
}

/// GET /cpu_task
pub fn cpu_task(w: &mut dyn ResponseSink, request: HttpRequest) {
    let sum: u64 = (0..10_000u64).map(black_box).sum();
    write_text(w, StatusCode::OK, "CPU bound task finish!");

    let ids = request_log_fields(&request);
    tracing::info!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/cpu_task",
        sum,
        "cpu task"
    );
}

/// GET /random_status
///
/// Replies with one of [`RANDOM_STATUSES`] and a JSON status body.
pub fn random_status(w: &mut dyn ResponseSink, request: HttpRequest) {
    let status = RANDOM_STATUSES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(StatusCode::OK);

    if status == StatusCode::OK {
        write_json(
            w,
            &HealthResponse {
                status: "random_status".to_string(),
            },
        );
    } else {
        http_error(w, status.canonical_reason().unwrap_or("random_status"), status);
    }

    let ids = request_log_fields(&request);
    tracing::info!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/random_status",
        status = status.as_u16(),
        "random status"
    );
}

/// GET /random_sleep
pub fn random_sleep(w: &mut dyn ResponseSink, request: HttpRequest) {
    let seconds = rand::thread_rng().gen_range(0..MAX_RANDOM_SLEEP_SECONDS);
    thread::sleep(Duration::from_secs(seconds));
    write_text(w, StatusCode::OK, "random sleep");

    let ids = request_log_fields(&request);
    tracing::info!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/random_sleep",
        seconds,
        "random sleep"
    );
}

/// GET /error_test
pub fn error_test(w: &mut dyn ResponseSink, request: HttpRequest) {
    let ids = request_log_fields(&request);
    tracing::error!(
        target: "observer.demo",
        trace_id = %ids.trace_id,
        span_id = %ids.span_id,
        path = "/error_test",
        "error test"
    );
    http_error(w, "got error!!!!", StatusCode::INTERNAL_SERVER_ERROR);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::sink::BufferedResponse;
    use bytes::Bytes;

    fn serve(handler: fn(&mut dyn ResponseSink, HttpRequest)) -> BufferedResponse {
        let mut sink = BufferedResponse::new();
        handler(&mut sink, HttpRequest::new(Bytes::new()));
        sink
    }

    #[test]
    fn test_hello_world() {
        let sink = serve(hello_world);
        assert_eq!(sink.committed_status(), Some(StatusCode::OK));
        assert_eq!(sink.body(), b"Hello World");
    }

    #[test]
    fn test_cpu_task() {
        let sink = serve(cpu_task);
        assert_eq!(sink.body(), b"CPU bound task finish!");
    }

    #[test]
    fn test_error_test_replies_500() {
        let sink = serve(error_test);
        assert_eq!(
            sink.committed_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(sink.body(), b"got error!!!!\n");
    }

    #[test]
    fn test_random_status_stays_in_range() {
        for _ in 0..20 {
            let sink = serve(random_status);
            let status = sink.committed_status().unwrap();
            assert!(RANDOM_STATUSES.contains(&status), "unexpected {status}");
        }
    }
}
