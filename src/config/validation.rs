//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and addresses.
//! All errors are collected so a broken file is reported in one pass.

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address {:?}", config.listener.bind_address),
        ));
    }

    if config.upstream.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "upstream.address",
            format!("invalid socket address {:?}", config.upstream.address),
        ));
    }

    if config.upstream.timeout_secs == 0 {
        errors.push(ValidationError::new("upstream.timeout_secs", "must be > 0"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }

    let resizer = &config.image_resizer;
    if resizer.enabled && resizer.scaler_path.trim().is_empty() {
        errors.push(ValidationError::new(
            "image_resizer.scaler_path",
            "must be set when the resizer is enabled",
        ));
    }
    if resizer.max_scaler_procs == 0 {
        errors.push(ValidationError::new(
            "image_resizer.max_scaler_procs",
            "must be > 0",
        ));
    }
    if resizer.fetch.connect_timeout_secs == 0 || resizer.fetch.response_header_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "image_resizer.fetch",
            "timeouts must be > 0",
        ));
    }

    let uploads = &config.uploads;
    if uploads.exiftool_path.trim().is_empty() {
        errors.push(ValidationError::new("uploads.exiftool_path", "must be set"));
    }
    if uploads.artifact_name.is_empty() {
        errors.push(ValidationError::new("uploads.artifact_name", "must be set"));
    }
    for route in &uploads.routes {
        if !route.path_suffix.starts_with('/') {
            errors.push(ValidationError::new(
                "uploads.routes.path_suffix",
                format!("{:?} must start with '/'", route.path_suffix),
            ));
        }
        if route.processor.is_empty() {
            errors.push(ValidationError::new(
                "uploads.routes.processor",
                "must not be empty",
            ));
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "invalid socket address {:?}",
                config.observability.metrics_address
            ),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
