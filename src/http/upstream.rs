//! The single upstream application server.
//!
//! # Responsibilities
//! - Rewrite inbound URIs to point at the upstream
//! - Send requests with a per-request timeout
//! - Turn transport failures into 502s

use std::str::FromStr;
use std::time::Duration;

use axum::{
    body::Body,
    http::{
        uri::{Authority, InvalidUri, PathAndQuery, Scheme},
        Request, Response, Uri,
    },
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::UpstreamConfig;
use crate::http::request::request_id;
use crate::http::response::bad_gateway;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("build upstream uri: {0}")]
    Uri(#[from] axum::http::Error),
    #[error("upstream request: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, Body>,
    authority: Authority,
    timeout: Duration,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, InvalidUri> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self {
            client,
            authority: Authority::from_str(&config.address)?,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// `uri` re-targeted at the upstream, keeping path and query.
    pub fn uri_for(&self, uri: &Uri) -> Result<Uri, axum::http::Error> {
        let mut parts = uri.clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        Ok(Uri::from_parts(parts)?)
    }

    /// Send `request` upstream. Its URI may be origin-form.
    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>, UpstreamError> {
        *request.uri_mut() = self.uri_for(request.uri())?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Send `request` upstream, answering 502 if that fails.
    pub async fn forward(&self, request: Request<Body>) -> Response<Body> {
        let request_id = request_id(request.headers());
        match self.send(request).await {
            Ok(response) => response,
            Err(e) => bad_gateway(&request_id, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_is_retargeted() {
        let upstream = Upstream::new(&UpstreamConfig {
            address: "10.0.0.1:3000".into(),
            timeout_secs: 1,
        })
        .unwrap();

        let uri = upstream.uri_for(&Uri::from_static("/a/b?c=d")).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:3000/a/b?c=d");
    }
}
