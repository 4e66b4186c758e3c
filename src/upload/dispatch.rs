//! Choosing how a file part's bytes are transformed before storage.
//!
//! Transforms are tried in order and the first that applies wins. A part no
//! transform claims is stored as-is.

use std::io;

use async_trait::async_trait;

use crate::bytestream::ByteStream;
use crate::config::UploadConfig;
use crate::upload::exif::ExifStripper;
use crate::upload::extract::{ArtifactExtractor, ExtractError};
use crate::upload::preauth::Preauth;

/// What a transform may look at when deciding and running.
#[derive(Debug, Clone, Copy)]
pub struct PartContext<'a> {
    pub field: &'a str,
    pub filename: &'a str,
    pub preauth: &'a Preauth,
    pub request_id: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[async_trait]
pub trait PartTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, ctx: &PartContext<'_>) -> bool;

    async fn transform(&self, input: ByteStream, ctx: &PartContext<'_>) -> Result<ByteStream, TransformError>;
}

pub struct TransformDispatcher {
    transforms: Vec<Box<dyn PartTransform>>,
}

impl TransformDispatcher {
    pub fn new(transforms: Vec<Box<dyn PartTransform>>) -> Self {
        Self { transforms }
    }

    /// Metadata stripping, then artifact extraction.
    pub fn standard(config: &UploadConfig) -> Self {
        Self::new(vec![
            Box::new(ExifStripper::new(&config.exiftool_path)),
            Box::new(ArtifactExtractor::new(&config.artifact_name, &config.temp_dir)),
        ])
    }

    pub async fn dispatch(&self, input: ByteStream, ctx: &PartContext<'_>) -> Result<ByteStream, TransformError> {
        match self.transforms.iter().find(|t| t.applies(ctx)) {
            Some(transform) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    field = %ctx.field,
                    filename = %ctx.filename,
                    transform = transform.name(),
                    "Transforming file part"
                );
                transform.transform(input, ctx).await
            }
            None => Ok(input),
        }
    }
}

/// Filenames that could escape the storage directory.
pub fn is_illegal_filename(filename: &str) -> bool {
    filename.contains('/') || filename.contains('\\') || filename == "." || filename == ".."
}
