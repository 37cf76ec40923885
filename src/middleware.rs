use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::key_generator::client_address;

/// Paths whose response lives as long as the connection; logged by the
/// session itself instead.
const STREAMING_PATHS: &[&str] = &["/sse"];

/// Logging middleware for request/response tracking
pub async fn logging_middleware(
    request: Request,
    next: Next,
) -> Response {
    if STREAMING_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_address(&request);
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let took = started.elapsed();
    if status.is_server_error() {
        error!(target: "eventgate::middleware", method = %method, uri = %uri, client_ip = %client_ip, status = %status, took = ?took, "Request completed");
    } else if status.is_client_error() {
        warn!(target: "eventgate::middleware", method = %method, uri = %uri, client_ip = %client_ip, status = %status, took = ?took, "Request completed");
    } else {
        info!(target: "eventgate::middleware", method = %method, uri = %uri, client_ip = %client_ip, status = %status, took = ?took, "Request completed");
    }

    response
}
