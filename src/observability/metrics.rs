//! Metrics collection and exposition.
//!
//! # Metrics
//! - `image_resize_processes` (gauge): scaler processes alive now
//! - `image_resize_concurrency_limit_exceeds_total` (counter)
//! - `image_resize_completed_total` (counter)
//! - `multipart_upload_requests` (counter, by processor type)
//! - `multipart_upload_files` (counter, by processor type)
//! - `multipart_upload_bytes` (counter, by processor type)
//!
//! Without an installed recorder every call is a no-op, which keeps unit tests
//! free of process-wide side effects.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_scaler_processes(live: u32) {
    gauge!("image_resize_processes").set(f64::from(live));
}

pub fn record_concurrency_limit_exceeded() {
    counter!("image_resize_concurrency_limit_exceeds_total").increment(1);
}

pub fn record_resize_completed() {
    counter!("image_resize_completed_total").increment(1);
}

pub fn record_upload_request(processor: &str) {
    counter!("multipart_upload_requests", "type" => processor.to_string()).increment(1);
}

pub fn record_upload_file(processor: &str) {
    counter!("multipart_upload_files", "type" => processor.to_string()).increment(1);
}

pub fn record_upload_bytes(processor: &str, bytes: u64) {
    counter!("multipart_upload_bytes", "type" => processor.to_string()).increment(bytes);
}
