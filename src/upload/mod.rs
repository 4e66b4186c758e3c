//! Multipart upload rewriting.
//!
//! # Data Flow
//! ```text
//! POST .../uploads (multipart/form-data)
//!     → preauth.rs (ask upstream, get TempPath / MaximumSize)
//!     → rewriter.rs (walk parts in order)
//!         file part  → dispatch.rs (exif.rs | extract.rs | as-is) → storage
//!                    → metadata fields written, names finalized (guard.rs)
//!         other part → copied
//!     → processor.rs (X-Multipart-Fields header)
//!     → upstream, with a fresh boundary (form.rs)
//! ```
//!
//! # Design Decisions
//! - Injected field names and path-like filenames abort the whole request
//! - Nothing is forwarded until the entire form has been rewritten
//! - Non-multipart requests on upload routes pass through untouched

pub mod dispatch;
pub mod exif;
pub mod extract;
pub mod form;
pub mod guard;
pub mod preauth;
pub mod processor;
pub mod rewriter;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode},
};
use multer::{Constraints, Multipart, SizeLimit};

use crate::config::{UploadConfig, UploadRouteConfig};
use crate::http::request::request_id;
use crate::http::response::{bad_gateway, fail_500, reject};
use crate::http::upstream::Upstream;
use crate::observability::metrics;
use crate::storage::{FileStore, StoreError};

pub use dispatch::{PartContext, PartTransform, TransformDispatcher, TransformError};
pub use form::MultipartWriter;
pub use guard::FinalizedFieldSet;
pub use preauth::{Authorization, Preauth, PreauthError};
pub use processor::{MultipartFormProcessor, ProcessorError, SavedFileTracker, X_MULTIPART_FIELDS};
pub use rewriter::{rewrite_form, RewriteContext, RewrittenForm};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("injected client parameter: {0}")]
    InjectedClientParam(String),
    #[error("illegal filename: {0:?}")]
    IllegalFilename(String),
    #[error("entity is too large")]
    EntityTooLarge,
    #[error("error while removing EXIF")]
    MetadataRemoval,
    #[error("parse multipart: {0}")]
    Multipart(#[from] multer::Error),
    #[error("transform file part: {0}")]
    Transform(#[from] TransformError),
    #[error("persisting multipart file: {0}")]
    Persist(#[source] StoreError),
    #[error("process multipart part: {0}")]
    Processor(#[from] ProcessorError),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InjectedClientParam(_) | UploadError::IllegalFilename(_) => StatusCode::BAD_REQUEST,
            UploadError::EntityTooLarge
            | UploadError::Multipart(multer::Error::StreamSizeExceeded { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::MetadataRemoval => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self, request_id: &str) -> Response<Body> {
        match self.status() {
            StatusCode::BAD_REQUEST => reject(request_id, StatusCode::BAD_REQUEST, "Bad Request", &self),
            StatusCode::PAYLOAD_TOO_LARGE => {
                reject(request_id, StatusCode::PAYLOAD_TOO_LARGE, "Request Entity Too Large", &self)
            }
            StatusCode::UNPROCESSABLE_ENTITY => reject(
                request_id,
                StatusCode::UNPROCESSABLE_ENTITY,
                "Failed to process image",
                &self,
            ),
            _ => fail_500(request_id, &self),
        }
    }
}

/// Boundary of a `multipart/form-data` request, if it is one.
pub fn multipart_boundary(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    multer::parse_boundary(content_type).ok()
}

pub struct UploadHandler {
    upstream: Upstream,
    store: Arc<dyn FileStore>,
    dispatcher: TransformDispatcher,
    routes: Vec<UploadRouteConfig>,
    default_dir: PathBuf,
    max_form_bytes: u64,
}

impl UploadHandler {
    pub fn new(config: &UploadConfig, upstream: Upstream, store: Arc<dyn FileStore>) -> Self {
        Self {
            upstream,
            store,
            dispatcher: TransformDispatcher::standard(config),
            routes: config.routes.clone(),
            default_dir: PathBuf::from(&config.temp_dir),
            max_form_bytes: config.max_form_bytes,
        }
    }

    /// The upload route whose suffix `path` ends with.
    pub fn route_for(&self, path: &str) -> Option<&UploadRouteConfig> {
        let path = path.trim_end_matches('/');
        self.routes
            .iter()
            .find(|route| path.ends_with(route.path_suffix.trim_end_matches('/')))
    }

    /// Rewrite and forward an upload on `route`.
    pub async fn handle(&self, route: &UploadRouteConfig, request: Request<Body>) -> Response<Body> {
        let request_id = request_id(request.headers());
        let Some(boundary) = multipart_boundary(request.headers()) else {
            return self.upstream.forward(request).await;
        };

        let (mut head, body) = request.into_parts();
        let preauth = match preauth::authorize(&self.upstream, &head).await {
            Ok(Authorization::Granted(preauth)) => preauth,
            Ok(Authorization::Denied(response)) => return response,
            Err(e) => return bad_gateway(&request_id, &e),
        };

        metrics::record_upload_request(&route.processor);
        let constraints =
            Constraints::new().size_limit(SizeLimit::new().whole_stream(self.max_form_bytes));
        let multipart = Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

        let ctx = RewriteContext {
            preauth: &preauth,
            store: self.store.as_ref(),
            dispatcher: &self.dispatcher,
            default_dir: &self.default_dir,
            request_id: &request_id,
        };
        let mut processor = SavedFileTracker::new(route.processor.clone());
        let form = match rewrite_form(multipart, &ctx, &mut processor).await {
            Ok(form) => form,
            Err(e) => return e.into_response(&request_id),
        };
        if let Err(e) = processor.finalize(&mut head.headers) {
            return fail_500(&request_id, &e);
        }

        tracing::info!(
            request_id = %request_id,
            processor = %route.processor,
            files = processor.count(),
            "Forwarding rewritten upload"
        );

        head.headers.remove(header::TRANSFER_ENCODING);
        head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(form.body.len()));
        match HeaderValue::from_str(&form.content_type) {
            Ok(value) => head.headers.insert(header::CONTENT_TYPE, value),
            Err(e) => return fail_500(&request_id, &e),
        };

        self.upstream
            .forward(Request::from_parts(head, Body::from(form.body)))
            .await
    }
}
