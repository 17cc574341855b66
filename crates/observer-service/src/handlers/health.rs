//! Health check handler.
//!
//! Liveness probe. The service has no downstream dependencies, so the
//! answer is always `OK` while the process can serve requests.

use crate::middleware::sink::{write_json, HttpRequest, ResponseSink};
use crate::models::HealthResponse;

/// Handler for GET /health
///
/// ## Example Response
///
/// ```json
/// {"status": "OK"}
/// ```
pub fn health_check(w: &mut dyn ResponseSink, _request: HttpRequest) {
    write_json(
        w,
        &HealthResponse {
            status: "OK".to_string(),
        },
    );
}
