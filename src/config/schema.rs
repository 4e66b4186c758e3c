//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the interception proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Application server that receives forwarded requests.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Image scaling settings.
    pub image_resizer: ImageResizerConfig,

    /// Multipart upload rewriting settings.
    pub uploads: UploadConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8181").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8181".to_string(),
        }
    }
}

/// Upstream application server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Timeout for a single upstream round trip in seconds.
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3000".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Timeout configuration for inbound requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 600 }
    }
}

/// Image resizer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageResizerConfig {
    /// Intercept scaled image directives. When disabled they are served unscaled.
    pub enabled: bool,

    /// Path (or name on `PATH`) of the scaler executable.
    pub scaler_path: String,

    /// Maximum number of scaler processes alive at once.
    pub max_scaler_procs: u32,

    /// Source images larger than this many bytes are never scaled.
    pub max_filesize: u64,

    /// Outbound fetch settings for remote source images.
    pub fetch: FetchConfig,
}

impl Default for ImageResizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scaler_path: "resize-image".to_string(),
            max_scaler_procs: 100,
            max_filesize: 250 * 1000,
            fetch: FetchConfig::default(),
        }
    }
}

/// HTTP client settings used to fetch remote source images.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Dial timeout, TLS handshake included.
    pub connect_timeout_secs: u64,

    /// TCP keepalive interval.
    pub tcp_keepalive_secs: u64,

    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,

    /// How long an idle connection may stay pooled.
    pub pool_idle_timeout_secs: u64,

    /// Deadline for receiving the response headers.
    pub response_header_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            tcp_keepalive_secs: 10,
            pool_max_idle_per_host: 2,
            pool_idle_timeout_secs: 30,
            response_header_timeout_secs: 30,
        }
    }
}

/// Upload rewriting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Path (or name on `PATH`) of the metadata stripping tool.
    pub exiftool_path: String,

    /// Directory for stored files when preauthorization names none.
    pub temp_dir: String,

    /// Name of the inner archive entry extracted when preauthorization asks for it.
    pub artifact_name: String,

    /// Hard limit on the size of an inbound multipart body.
    pub max_form_bytes: u64,

    /// Requests whose path ends with one of these suffixes are rewritten.
    pub routes: Vec<UploadRouteConfig>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            exiftool_path: "exiftool".to_string(),
            temp_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            artifact_name: "dump.lsif".to_string(),
            max_form_bytes: 1024 * 1024 * 1024,
            routes: vec![UploadRouteConfig {
                path_suffix: "/uploads".to_string(),
                processor: "uploads".to_string(),
            }],
        }
    }
}

/// One upload endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadRouteConfig {
    /// Path suffix to match (e.g. "/uploads").
    pub path_suffix: String,

    /// Processor label used in logs and metrics.
    pub processor: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9229".to_string(),
        }
    }
}
