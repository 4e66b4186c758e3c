//! Rewriting a multipart form.
//!
//! File parts are stored and replaced by metadata fields; every other part
//! is copied. The output form is complete before anything is forwarded, so
//! a rejected form sends nothing upstream.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::TryStreamExt;
use multer::{Field, Multipart};

use crate::bytestream::ByteStream;
use crate::observability::metrics;
use crate::storage::{FileStore, SaveOpts, StoreError};
use crate::upload::dispatch::{is_illegal_filename, PartContext, TransformDispatcher, TransformError};
use crate::upload::exif::is_removal_failure;
use crate::upload::extract::ExtractError;
use crate::upload::form::MultipartWriter;
use crate::upload::guard::FinalizedFieldSet;
use crate::upload::preauth::Preauth;
use crate::upload::processor::MultipartFormProcessor;
use crate::upload::UploadError;

/// The rewritten body and its content type.
#[derive(Debug)]
pub struct RewrittenForm {
    pub body: Bytes,
    pub content_type: String,
}

/// Everything a rewrite reads from.
pub struct RewriteContext<'a> {
    pub preauth: &'a Preauth,
    pub store: &'a dyn FileStore,
    pub dispatcher: &'a TransformDispatcher,
    pub default_dir: &'a Path,
    pub request_id: &'a str,
}

pub async fn rewrite_form(
    multipart: Multipart<'static>,
    ctx: &RewriteContext<'_>,
    processor: &mut dyn MultipartFormProcessor,
) -> Result<RewrittenForm, UploadError> {
    let mut stored = Vec::new();
    let result = rewrite_parts(multipart, ctx, processor, &mut stored).await;
    if result.is_err() {
        // files stored before the failure are never referenced
        for path in stored {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(request_id = %ctx.request_id, path = ?path, error = %e, "Failed to remove stored file");
            }
        }
    }
    result
}

async fn rewrite_parts(
    mut multipart: Multipart<'static>,
    ctx: &RewriteContext<'_>,
    processor: &mut dyn MultipartFormProcessor,
    stored: &mut Vec<PathBuf>,
) -> Result<RewrittenForm, UploadError> {
    let mut writer = MultipartWriter::new();
    let mut finalized = FinalizedFieldSet::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().filter(|n| !n.is_empty()).map(str::to_owned) else {
            continue;
        };

        // a client part may not reuse a name the proxy already wrote
        if finalized.contains(&name) {
            return Err(UploadError::InjectedClientParam(name));
        }

        match field.file_name().filter(|f| !f.is_empty()).map(str::to_owned) {
            Some(filename) => {
                let part = FilePart {
                    name: &name,
                    filename: &filename,
                };
                handle_file(field, part, ctx, &mut writer, &mut finalized, processor, stored).await?
            }
            None => copy_field(field, &name, &mut writer, processor).await?,
        }
    }

    Ok(RewrittenForm {
        content_type: writer.content_type(),
        body: writer.finish(),
    })
}

struct FilePart<'a> {
    name: &'a str,
    filename: &'a str,
}

async fn copy_field(
    mut field: Field<'static>,
    name: &str,
    writer: &mut MultipartWriter,
    processor: &mut dyn MultipartFormProcessor,
) -> Result<(), UploadError> {
    writer.begin_part(field.headers());
    while let Some(chunk) = field.chunk().await? {
        writer.write(&chunk);
    }
    processor.process_field(name, writer).await?;
    Ok(())
}

async fn handle_file(
    field: Field<'static>,
    FilePart { name, filename }: FilePart<'_>,
    ctx: &RewriteContext<'_>,
    writer: &mut MultipartWriter,
    finalized: &mut FinalizedFieldSet,
    processor: &mut dyn MultipartFormProcessor,
    stored_paths: &mut Vec<PathBuf>,
) -> Result<(), UploadError> {
    if is_illegal_filename(filename) {
        return Err(UploadError::IllegalFilename(filename.to_string()));
    }
    metrics::record_upload_file(processor.name());

    let part = PartContext {
        field: name,
        filename,
        preauth: ctx.preauth,
        request_id: ctx.request_id,
    };
    let input: ByteStream = Box::pin(field.map_err(io::Error::other));
    let data = match ctx.dispatcher.dispatch(input, &part).await {
        Ok(data) => data,
        Err(TransformError::Extract(ExtractError::TooLarge { .. })) => return Err(UploadError::EntityTooLarge),
        Err(e) => return Err(e.into()),
    };

    let opts = SaveOpts {
        dir: ctx
            .preauth
            .temp_path
            .clone()
            .unwrap_or_else(|| ctx.default_dir.to_path_buf()),
        prefix: filename.to_string(),
        max_size: ctx.preauth.maximum_size,
    };
    let stored = match ctx.store.save(filename, data, None, &opts).await {
        Ok(stored) => stored,
        Err(StoreError::EntityTooLarge) => return Err(UploadError::EntityTooLarge),
        Err(StoreError::Read(e)) if is_removal_failure(&e) => return Err(UploadError::MetadataRemoval),
        Err(e) => return Err(UploadError::Persist(e)),
    };
    stored_paths.push(stored.local_path.clone());

    // the part's own name now refers to server data as well
    finalized.insert(name);
    for (key, value) in stored.finalize_fields(name) {
        writer.write_field(&key, &value);
        finalized.insert(key);
    }
    metrics::record_upload_bytes(processor.name(), stored.size);

    processor.process_file(name, &stored, writer).await?;
    Ok(())
}
