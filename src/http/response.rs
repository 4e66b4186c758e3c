//! Error responses.
//!
//! # Design Decisions
//! - Every failure is logged with the request ID before it is answered
//! - Internal details never reach the client body

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Log `err` and answer 500.
pub fn fail_500(request_id: &str, err: &dyn std::fmt::Display) -> Response<Body> {
    tracing::error!(request_id = %request_id, error = %err, "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

/// Log `err` and answer 502.
pub fn bad_gateway(request_id: &str, err: &dyn std::fmt::Display) -> Response<Body> {
    tracing::error!(request_id = %request_id, error = %err, "Upstream error");
    (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
}

/// Answer `status` with a short plain-text reason.
pub fn reject(request_id: &str, status: StatusCode, reason: &'static str, err: &dyn std::fmt::Display) -> Response<Body> {
    tracing::warn!(request_id = %request_id, status = %status, error = %err, "Request rejected");
    (status, reason).into_response()
}
