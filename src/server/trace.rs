//! `X-Trace-Id` propagation.

use crate::types::TraceId;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Span;

pub const TRACE_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Adopt the caller's trace id (or mint one), expose it to handlers as an
/// extension and echo it on the response.
pub async fn propagate_trace_id(mut request: Request, next: Next) -> Response {
    let trace_id = TraceId::from_header(
        request
            .headers()
            .get(&TRACE_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    request.extensions_mut().insert(trace_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

/// Request span for `TraceLayer`, labelled with the propagated trace id.
pub fn request_span(request: &Request) -> Span {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.as_str().to_string())
        .unwrap_or_default();
    tracing::info_span!(
        "http",
        method = %request.method(),
        path = %request.uri().path(),
        trace_id = %trace_id,
    )
}
