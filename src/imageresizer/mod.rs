//! Image resizing subsystem.
//!
//! # Data Flow
//! ```text
//! upstream response with X-Send-Data: send-scaled-img:...
//!     → params.rs (unpack ResizeRequest)
//!     → source.rs (open file or fetch URL)
//!     → scaler.rs (size check, gate.rs slot, spawn scaler)
//!     → streamer.rs (stream resized or original image to client)
//! ```
//!
//! # Design Decisions
//! - A broken directive or unreadable source fails the request (500)
//! - Every other failure serves the original image unchanged
//! - The concurrency slot lives exactly as long as the scaler process handle

pub mod gate;
pub mod params;
pub mod scaler;
pub mod source;
pub mod streamer;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{response::Parts, HeaderMap, Response},
};

use crate::config::ImageResizerConfig;
use crate::http::request::request_id;
use crate::http::response::fail_500;
use crate::observability;

pub use gate::{ConcurrencyGate, ScalerPermit};
pub use params::{ResizeRequest, SEND_SCALED_IMAGE};
pub use scaler::{Fallback, ImageScaler, ResizeError, ScalerContext, ScalerRun};
pub use source::{SourceError, SourceImage, SourceImageOpener};
pub use streamer::{ResizeLog, ScaledOutput};

/// Serves `send-scaled-img:` directives.
#[derive(Debug, Clone)]
pub struct ImageResizer {
    enabled: bool,
    opener: SourceImageOpener,
    scaler: ImageScaler,
}

impl ImageResizer {
    pub fn new(config: &ImageResizerConfig, gate: Arc<ConcurrencyGate>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            enabled: config.enabled,
            opener: SourceImageOpener::new(&config.fetch)?,
            scaler: ImageScaler::new(gate, config),
        })
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        self.scaler.gate()
    }

    /// Replace the upstream body with the scaled image named by `data`.
    pub async fn inject(&self, head: Parts, data: &str, request_headers: &HeaderMap) -> Response<Body> {
        let start = Instant::now();
        let request_id = request_id(request_headers);

        let params = match ResizeRequest::unpack(data) {
            Ok(params) => params,
            // the upstream sent a malformed directive; nothing sensible to serve
            Err(e) => {
                return fail_500(
                    &request_id,
                    &format!("ImageResizer: failed reading image resize params: {e}"),
                )
            }
        };

        let source = match self.opener.open(&params.location).await {
            Ok(source) => source,
            Err(e) => {
                return fail_500(
                    &request_id,
                    &format!("ImageResizer: failed opening image data stream: {e}"),
                )
            }
        };

        let log = ResizeLog {
            request_id: request_id.clone(),
            start,
            width: params.width,
            content_type: params.content_type.clone(),
            original_filesize: source.declared_len,
        };

        let output = if self.enabled {
            let ctx = ScalerContext {
                request_id,
                env: observability::tracing::env_from_headers(request_headers),
            };
            match self.scaler.try_resize(source, &params, &ctx) {
                Ok(run) => ScaledOutput::Scaled(run),
                Err(Fallback { source, reason }) => {
                    log.degraded(&reason);
                    ScaledOutput::Original(source)
                }
            }
        } else {
            ScaledOutput::Original(source.stream)
        };

        streamer::serve(head, output, log).await
    }
}
