//! Response sink and handler capability.
//!
//! Handlers in this service write directly to a [`ResponseSink`] instead of
//! returning a response value. That lets every middleware layer observe the
//! exact sequence of header commits and body writes the handler performs.
//!
//! The sink follows the usual HTTP output-writer contract:
//! - The first `write_header` call commits the status; later calls are ignored.
//! - A body `write` without a prior commit implicitly commits `200 OK`.

use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::io;

/// Request type seen by handlers: the body is fully buffered.
pub type HttpRequest = Request<Bytes>;

/// Output side of a single HTTP exchange.
pub trait ResponseSink {
    /// Mutable access to the response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commit the response status.
    fn write_header(&mut self, status: StatusCode);

    /// Append bytes to the response body.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Opaque request handler.
///
/// Takes the sink and the request, produces nothing. Middleware layers
/// implement this trait too, which is how they compose.
pub trait Handler: Send + Sync {
    fn serve(&self, w: &mut dyn ResponseSink, request: HttpRequest);
}

impl<F> Handler for F
where
    F: Fn(&mut dyn ResponseSink, HttpRequest) + Send + Sync,
{
    fn serve(&self, w: &mut dyn ResponseSink, request: HttpRequest) {
        self(w, request)
    }
}

/// The real sink used by the server adapter.
///
/// Buffers everything the handler produces and converts into an axum
/// [`Response`] once the handler chain has returned.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed status, if any call committed one yet.
    pub fn committed_status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Bytes written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl ResponseSink for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_some() {
            tracing::debug!(
                target: "observer.http",
                ignored = status.as_u16(),
                "superfluous write_header call"
            );
            return;
        }
        self.status = Some(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let status = self.status.unwrap_or(StatusCode::OK);
        let mut response = (status, self.body.freeze()).into_response();
        // Handler headers replace the defaults axum derived from the body
        response.headers_mut().extend(self.headers);
        response
    }
}

/// Write a plain-text body, committing `status` first.
pub fn write_text(w: &mut dyn ResponseSink, status: StatusCode, body: &str) {
    w.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    w.write_header(status);
    if let Err(e) = w.write(body.as_bytes()) {
        tracing::warn!(target: "observer.http", error = %e, "Failed to write response body");
    }
}

/// Serialize `value` as a JSON body with `200 OK`.
///
/// Falls back to a 500 text error when serialization fails.
pub fn write_json<T: Serialize>(w: &mut dyn ResponseSink, value: &T) {
    match serde_json::to_vec(value) {
        Ok(mut payload) => {
            payload.push(b'\n');
            w.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            w.write_header(StatusCode::OK);
            if let Err(e) = w.write(&payload) {
                tracing::warn!(target: "observer.http", error = %e, "Failed to write JSON body");
            }
        }
        Err(e) => http_error(w, &e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Reply with a plain-text error message and status.
pub fn http_error(w: &mut dyn ResponseSink, message: &str, status: StatusCode) {
    w.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    w.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    w.write_header(status);
    let body = format!("{message}\n");
    if let Err(e) = w.write(body.as_bytes()) {
        tracing::warn!(target: "observer.http", error = %e, "Failed to write error body");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_body_write_commits_ok() {
        let mut sink = BufferedResponse::new();
        sink.write(b"hello").unwrap();

        assert_eq!(sink.committed_status(), Some(StatusCode::OK));
        assert_eq!(sink.body(), b"hello");
    }

    #[test]
    fn test_first_write_header_wins() {
        let mut sink = BufferedResponse::new();
        sink.write_header(StatusCode::NOT_FOUND);
        sink.write_header(StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(sink.committed_status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_write_after_commit_keeps_status() {
        let mut sink = BufferedResponse::new();
        sink.write_header(StatusCode::ACCEPTED);
        sink.write(b"body").unwrap();

        assert_eq!(sink.committed_status(), Some(StatusCode::ACCEPTED));
    }

    #[test]
    fn test_closure_is_a_handler() {
        let handler = |w: &mut dyn ResponseSink, _req: HttpRequest| {
            w.write_header(StatusCode::CREATED);
        };
        let mut sink = BufferedResponse::new();
        handler.serve(&mut sink, Request::new(Bytes::new()));

        assert_eq!(sink.committed_status(), Some(StatusCode::CREATED));
    }

    #[test]
    fn test_http_error_sets_headers() {
        let mut sink = BufferedResponse::new();
        http_error(&mut sink, "got error!!!!", StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(
            sink.committed_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(sink.body(), b"got error!!!!\n");
        assert_eq!(
            sink.headers_mut().get(header::X_CONTENT_TYPE_OPTIONS),
            Some(&HeaderValue::from_static("nosniff"))
        );
    }

    #[tokio::test]
    async fn test_into_response_preserves_status_headers_and_body() {
        let mut sink = BufferedResponse::new();
        write_json(&mut sink, &serde_json::json!({"status": "OK"}));

        let response = sink.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"status\":\"OK\"}\n");
    }

    #[test]
    fn test_untouched_sink_defaults_to_ok() {
        let response = BufferedResponse::new().into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
