//! Upload preauthorization.
//!
//! Before touching a multipart body the proxy asks the upstream whether the
//! upload is allowed, by sending the request headers with an empty body to
//! `<path>/authorize`. A 200 carries [`Preauth`]; any other answer is
//! relayed to the client unchanged.

use std::path::PathBuf;

use axum::{
    body::Body,
    http::{header, request, Method, Request, Response, StatusCode},
};
use serde::{Deserialize, Serialize};

use crate::http::upstream::{Upstream, UpstreamError};

const AUTHORIZE_SUFFIX: &str = "/authorize";
const MAX_PREAUTH_BYTES: usize = 32 * 1024;

/// Upstream instructions for one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preauth {
    /// Directory to store files in. Falls back to the configured temp dir.
    #[serde(rename = "TempPath", default)]
    pub temp_path: Option<PathBuf>,
    /// Extract the configured artifact from zip-structured file parts.
    #[serde(rename = "ProcessLsif", default)]
    pub process_artifact: bool,
    /// Per-file size ceiling in bytes.
    #[serde(rename = "MaximumSize", default)]
    pub maximum_size: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PreauthError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("build authorize request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("read authorize response: {0}")]
    Body(#[from] axum::Error),
    #[error("decode authorize response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of asking the upstream.
#[derive(Debug)]
pub enum Authorization {
    Granted(Preauth),
    /// The upstream's answer, to be relayed verbatim.
    Denied(Response<Body>),
}

/// Ask the upstream whether the request described by `head` may upload.
pub async fn authorize(upstream: &Upstream, head: &request::Parts) -> Result<Authorization, PreauthError> {
    let request = authorize_request(head)?;
    let response = upstream.send(request).await?;
    if response.status() != StatusCode::OK {
        return Ok(Authorization::Denied(response));
    }

    let body = axum::body::to_bytes(response.into_body(), MAX_PREAUTH_BYTES).await?;
    Ok(Authorization::Granted(serde_json::from_slice(&body)?))
}

fn authorize_request(head: &request::Parts) -> Result<Request<Body>, axum::http::Error> {
    let path = head.uri.path().trim_end_matches('/');
    let uri = match head.uri.query() {
        Some(query) => format!("{path}{AUTHORIZE_SUFFIX}?{query}"),
        None => format!("{path}{AUTHORIZE_SUFFIX}"),
    };

    let mut builder = Request::builder().method(Method::POST).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &head.headers {
            if name == header::CONTENT_LENGTH
                || name == header::CONTENT_TYPE
                || name == header::TRANSFER_ENCODING
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }
    builder.body(Body::empty())
}
