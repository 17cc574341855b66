//! Observer service error types.
//!
//! Errors that reach a client map to an HTTP status via [`ServiceError::status_code`].
//! Client-facing messages are intentionally generic; the actual error is
//! logged server-side. Startup errors (duplicate metric, exporter setup,
//! configuration) are returned from `main` and stop the process.

use crate::config::ConfigError;
use crate::middleware::sink::{HttpRequest, ResponseSink};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::{fmt, io};
use thiserror::Error;

/// Observer service error type.
///
/// Maps to HTTP status codes:
/// - MetricsEncoding: 500 Internal Server Error
/// - BadRequest: 400 Bad Request
/// - PayloadTooLarge: 413 Payload Too Large
/// - DuplicateMetric, TraceExporter, Config, Io: 500 (startup-only in practice)
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Metric already registered: {0}")]
    DuplicateMetric(String),

    #[error("Failed to encode metrics: {0}")]
    MetricsEncoding(#[from] fmt::Error),

    #[error("Failed to build trace exporter: {0}")]
    TraceExporter(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::DuplicateMetric(_)
            | ServiceError::MetricsEncoding(_)
            | ServiceError::TraceExporter(_)
            | ServiceError::Config(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn client_view(&self) -> (&'static str, String) {
        match self {
            ServiceError::BadRequest(reason) => ("BAD_REQUEST", reason.clone()),
            ServiceError::PayloadTooLarge(_) => ("PAYLOAD_TOO_LARGE", self.to_string()),
            ServiceError::MetricsEncoding(err) => {
                tracing::error!(target: "observer.metrics", error = %err, "Metrics encoding failed");
                (
                    "METRICS_ERROR",
                    "Metrics are temporarily unavailable".to_string(),
                )
            }
            other => {
                tracing::error!(target: "observer.http", error = %other, "Request failed");
                ("INTERNAL_ERROR", "An internal error occurred".to_string())
            }
        }
    }

    /// Write this error as a JSON error body to a handler sink.
    pub fn write_to(&self, w: &mut dyn ResponseSink) {
        let (code, message) = self.client_view();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        let payload = serde_json::to_vec(&body).unwrap_or_default();

        w.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        w.write_header(self.status_code());
        if let Err(e) = w.write(&payload) {
            tracing::warn!(target: "observer.http", error = %e, "Failed to write error body");
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (code, message) = self.client_view();
        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(error_response)).into_response()
    }
}

/// Handler wrapper for fallible handlers.
///
/// Runs `f` and writes the error body when it fails.
pub fn fallible<F>(f: F) -> impl Fn(&mut dyn ResponseSink, HttpRequest) + Send + Sync
where
    F: Fn(&mut dyn ResponseSink, HttpRequest) -> Result<(), ServiceError> + Send + Sync,
{
    move |w: &mut dyn ResponseSink, request: HttpRequest| {
        if let Err(e) = f(&mut *w, request) {
            e.write_to(w);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::sink::{BufferedResponse, Handler};
    use axum::body::Body;
    use bytes::Bytes;
    use http_body_util::BodyExt;

    // Helper function to read the response body as JSON
    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_display_duplicate_metric() {
        let error = ServiceError::DuplicateMetric("app_info".to_string());
        assert_eq!(format!("{}", error), "Metric already registered: app_info");
    }

    #[test]
    fn test_display_bad_request() {
        let error = ServiceError::BadRequest("body too large".to_string());
        assert_eq!(format!("{}", error), "Bad request: body too large");
    }

    #[test]
    fn test_display_payload_too_large() {
        let error = ServiceError::PayloadTooLarge(1024);
        assert_eq!(format!("{}", error), "Request body exceeds 1024 bytes");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServiceError::BadRequest("test".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::MetricsEncoding(fmt::Error).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::DuplicateMetric("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::PayloadTooLarge(1).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_into_response_bad_request() {
        let error = ServiceError::BadRequest("Request body unreadable".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_json = read_body_json(response.into_body()).await;
        assert_eq!(body_json["error"]["code"], "BAD_REQUEST");
        assert_eq!(body_json["error"]["message"], "Request body unreadable");
    }

    #[tokio::test]
    async fn test_into_response_internal_is_generic() {
        let error = ServiceError::TraceExporter("collector refused".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body_json = read_body_json(response.into_body()).await;
        assert_eq!(body_json["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body_json["error"]["message"], "An internal error occurred");
    }

    #[test]
    fn test_write_to_sink_hides_details() {
        let mut sink = BufferedResponse::new();
        ServiceError::MetricsEncoding(fmt::Error).write_to(&mut sink);

        assert_eq!(
            sink.committed_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        let body: serde_json::Value = serde_json::from_slice(sink.body()).unwrap();
        assert_eq!(body["error"]["code"], "METRICS_ERROR");
        assert_eq!(
            body["error"]["message"],
            "Metrics are temporarily unavailable"
        );
    }

    #[test]
    fn test_fallible_handler_writes_error() {
        let handler = fallible(|_w, _req| Err(ServiceError::MetricsEncoding(fmt::Error)));
        let mut sink = BufferedResponse::new();
        handler.serve(&mut sink, HttpRequest::new(Bytes::new()));

        assert_eq!(
            sink.committed_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }
}
