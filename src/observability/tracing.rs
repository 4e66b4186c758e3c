//! Distributed tracing support.
//!
//! W3C Trace Context headers on the inbound request are carried into child
//! process environments, together with the request's correlation id, so the
//! scaler's own telemetry joins the same trace.

use axum::http::HeaderMap;

use crate::http::X_REQUEST_ID;

const TRACE_HEADERS: [(&str, &str); 2] = [("traceparent", "TRACEPARENT"), ("tracestate", "TRACESTATE")];

/// Environment variables describing the trace context of `headers`.
pub fn env_from_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut env = Vec::new();
    for (header, var) in TRACE_HEADERS {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            env.push((var.to_string(), value.to_string()));
        }
    }
    if let Some(id) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        env.push(("CORRELATION_ID".to_string(), id.to_string()));
    }
    env
}
