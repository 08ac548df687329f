//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.
//! Only the path is recorded: query strings can carry reset tokens.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn, Instrument};

/// Logs at INFO for completed requests, WARN for 5xx.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Skip logging for health checks to reduce noise
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let span = tracing::info_span!("http_request", method = %method, path = %path);
    let response = next.run(request).instrument(span).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis(),
            "Request failed (5xx)"
        );
    } else if status >= 400 {
        info!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis(),
            "Request completed (4xx)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis(),
            "Request completed"
        );
    }

    response
}
