//! End-to-end tests for send-scaled-img interception.

use std::path::Path;
use std::sync::Arc;

use axum::{
    http::{header, HeaderMap, HeaderValue},
    routing::get,
    Router,
};
use intercept_proxy::config::ProxyConfig;
use intercept_proxy::http::senddata::X_SEND_DATA;
use intercept_proxy::imageresizer::{ConcurrencyGate, ResizeRequest, SEND_SCALED_IMAGE};

mod common;

/// Upstream answering `/avatar` with a directive for `location`.
async fn upstream_for(location: &Path, width: u32) -> std::net::SocketAddr {
    let directive = SEND_SCALED_IMAGE
        .pack(&ResizeRequest {
            location: location.to_string_lossy().into_owned(),
            content_type: "image/png".into(),
            width,
        })
        .unwrap();

    let router = Router::new().route(
        "/avatar",
        get(move || {
            let directive = directive.clone();
            async move {
                let mut headers = HeaderMap::new();
                headers.insert(X_SEND_DATA, HeaderValue::from_str(&directive).unwrap());
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
                headers.insert("x-upstream", HeaderValue::from_static("kept"));
                (headers, "placeholder")
            }
        }),
    );
    common::start_upstream(router).await
}

fn config(scaler: String) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.image_resizer.scaler_path = scaler;
    config.image_resizer.max_filesize = 250_000;
    config.image_resizer.max_scaler_procs = 100;
    config
}

fn source(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join("source.png");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

#[tokio::test]
async fn small_image_is_scaled() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = source(dir.path(), 100_000);
    let scaler = common::script(
        dir.path(),
        "scaler",
        "cat >/dev/null; printf 'scaled:%s:%s' \"$RESIZE_IMAGE_WIDTH\" \"$RESIZE_IMAGE_CONTENT_TYPE\"",
    );

    let upstream = upstream_for(&path, 200).await;
    let proxy = common::start_proxy(upstream, config(scaler)).await;

    let res = common::client().get(proxy.url("/avatar")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers().get(header::CONTENT_LENGTH).is_none());
    assert!(res.headers().get(X_SEND_DATA).is_none());
    assert_eq!(res.headers()["x-upstream"], "kept");
    assert_eq!(res.bytes().await.unwrap(), "scaled:200:image/png");
}

#[tokio::test]
async fn oversized_image_is_served_unchanged_without_scaler() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = source(dir.path(), 300_000);
    let marker = dir.path().join("ran");
    let scaler = common::script(
        dir.path(),
        "scaler",
        &format!("touch {}; cat", marker.display()),
    );

    let upstream = upstream_for(&path, 200).await;
    let proxy = common::start_proxy(upstream, config(scaler)).await;

    let res = common::client().get(proxy.url("/avatar")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap(), data);
    assert!(!marker.exists());
}

#[tokio::test]
async fn saturated_gate_serves_original() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = source(dir.path(), 1_000);
    let scaler = common::script(dir.path(), "scaler", "cat >/dev/null; printf scaled");

    let gate = Arc::new(ConcurrencyGate::new(100));
    let held: Vec<_> = (0..100).map(|_| gate.try_acquire().unwrap()).collect();

    let upstream = upstream_for(&path, 200).await;
    let proxy = common::start_proxy_with_gate(upstream, config(scaler), gate.clone()).await;

    let res = common::client().get(proxy.url("/avatar")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap(), data);
    assert_eq!(gate.rejected(), 1);
    assert_eq!(gate.live(), 100);

    drop(held);
    assert_eq!(gate.live(), 0);
}

#[tokio::test]
async fn failing_scaler_falls_back_to_original() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = source(dir.path(), 10_000);
    let scaler = common::script(dir.path(), "scaler", "cat >/dev/null; echo nope >&2; exit 3");

    let gate = Arc::new(ConcurrencyGate::new(4));
    let upstream = upstream_for(&path, 64).await;
    let proxy = common::start_proxy_with_gate(upstream, config(scaler), gate.clone()).await;

    let res = common::client().get(proxy.url("/avatar")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap(), data);
    assert_eq!(gate.live(), 0);
}

#[tokio::test]
async fn missing_source_is_a_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let scaler = common::script(dir.path(), "scaler", "cat");

    let upstream = upstream_for(&dir.path().join("missing.png"), 64).await;
    let proxy = common::start_proxy(upstream, config(scaler)).await;

    let res = common::client().get(proxy.url("/avatar")).send().await.unwrap();
    assert_eq!(res.status(), 500);
}

#[tokio::test]
async fn plain_responses_pass_through() {
    let router = Router::new().route("/plain", get(|| async { "hello" }));
    let upstream = common::start_upstream(router).await;
    let proxy = common::start_proxy(upstream, ProxyConfig::default()).await;

    let res = common::client().get(proxy.url("/plain")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers().get("x-request-id").is_some());
    assert_eq!(res.text().await.unwrap(), "hello");
}
