//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all proxy handler
//! - Wire up middleware (tracing, timeout, request ID)
//! - Route upload requests through the rewriter
//! - Forward everything else and act on send-data directives

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{uri::InvalidUri, HeaderMap, Request, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::http::senddata::X_SEND_DATA;
use crate::http::upstream::Upstream;
use crate::imageresizer::{ConcurrencyGate, ImageResizer, SEND_SCALED_IMAGE};
use crate::lifecycle::ShutdownSignal;
use crate::storage::LocalFileStore;
use crate::upload::UploadHandler;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid upstream address: {0}")]
    Upstream(#[from] InvalidUri),
    #[error("build image fetch client: {0}")]
    FetchClient(#[from] reqwest::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Upstream,
    pub resizer: Arc<ImageResizer>,
    pub uploads: Arc<UploadHandler>,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    gate: Arc<ConcurrencyGate>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let gate = Arc::new(ConcurrencyGate::new(config.image_resizer.max_scaler_procs));
        Self::with_gate(config, gate)
    }

    /// Like [`new`](Self::new), sharing an existing scaler gate.
    pub fn with_gate(config: ProxyConfig, gate: Arc<ConcurrencyGate>) -> Result<Self, ServerError> {
        let upstream = Upstream::new(&config.upstream)?;
        let resizer = Arc::new(ImageResizer::new(&config.image_resizer, gate.clone())?);
        let uploads = Arc::new(UploadHandler::new(
            &config.uploads,
            upstream.clone(),
            Arc::new(LocalFileStore),
        ));

        tracing::debug!(
            upstream = %config.upstream.address,
            scaler = %config.image_resizer.scaler_path,
            max_scaler_procs = config.image_resizer.max_scaler_procs,
            temp_dir = ?PathBuf::from(&config.uploads.temp_dir),
            "HTTP server configured"
        );

        let state = AppState {
            upstream,
            resizer,
            uploads,
        };
        Ok(Self {
            router: Self::build_router(&config, state),
            gate,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    if let Some(route) = state.uploads.route_for(request.uri().path()) {
        return state.uploads.handle(route, request).await;
    }

    let request_headers = request.headers().clone();
    let response = state.upstream.forward(request).await;
    intercept(&state, response, &request_headers).await
}

/// Act on an `X-Send-Data` directive in an upstream response.
async fn intercept(state: &AppState, mut response: Response<Body>, request_headers: &HeaderMap) -> Response<Body> {
    let Some(value) = response.headers_mut().remove(X_SEND_DATA) else {
        return response;
    };
    let data = match value.to_str() {
        Ok(data) => data.to_owned(),
        Err(e) => {
            tracing::warn!(request_id = %request_id(request_headers), error = %e, "Ignoring unreadable send-data header");
            return response;
        }
    };

    if SEND_SCALED_IMAGE.matches(&data) {
        let (head, _upstream_body) = response.into_parts();
        return state.resizer.inject(head, &data, request_headers).await;
    }

    tracing::warn!(request_id = %request_id(request_headers), "Ignoring unknown send-data directive");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    /// Address with nothing listening on it.
    async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_bad_gateway() {
        let mut config = ProxyConfig::default();
        config.upstream.address = closed_address().await;
        let server = HttpServer::new(config).unwrap();

        let response = server
            .router
            .oneshot(Request::get("/anything").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().contains_key(crate::http::X_REQUEST_ID));
    }

    #[tokio::test]
    async fn incoming_request_id_is_kept() {
        let mut config = ProxyConfig::default();
        config.upstream.address = closed_address().await;
        let server = HttpServer::new(config).unwrap();

        let request = Request::get("/")
            .header(crate::http::X_REQUEST_ID, "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = server.router.oneshot(request).await.unwrap();

        assert_eq!(response.headers()[crate::http::X_REQUEST_ID], "abc-123");
    }
}
