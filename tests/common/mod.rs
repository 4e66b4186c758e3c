//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use intercept_proxy::config::ProxyConfig;
use intercept_proxy::http::HttpServer;
use intercept_proxy::imageresizer::ConcurrencyGate;
use intercept_proxy::lifecycle::Shutdown;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral port as the mock upstream.
pub async fn start_upstream(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// A running proxy. Shuts down when dropped.
pub struct Proxy {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a proxy in front of `upstream`.
pub async fn start_proxy(upstream: SocketAddr, config: ProxyConfig) -> Proxy {
    let gate = Arc::new(ConcurrencyGate::new(config.image_resizer.max_scaler_procs));
    start_proxy_with_gate(upstream, config, gate).await
}

pub async fn start_proxy_with_gate(
    upstream: SocketAddr,
    mut config: ProxyConfig,
    gate: Arc<ConcurrencyGate>,
) -> Proxy {
    config.upstream.address = upstream.to_string();
    config.observability.metrics_enabled = false;

    let server = HttpServer::with_gate(config, gate).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    Proxy { addr, shutdown }
}

/// Write an executable shell script named `name` into `dir`.
pub fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
