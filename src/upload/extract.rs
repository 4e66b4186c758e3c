//! Extracting a single artifact from zip-structured uploads.
//!
//! Zip needs random access, so the part is spooled to disk first. The
//! stored file is the named entry's contents, not the archive.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::bytestream::{self, ByteStream};
use crate::upload::dispatch::{PartContext, PartTransform, TransformError};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("spool {path:?}: {source}")]
    Spool {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading upload: {0}")]
    Read(#[source] io::Error),
    #[error("archive does not contain {0}")]
    MissingArtifact(String),
    #[error("open archive: {0}")]
    Archive(#[from] ZipError),
    #[error("extract artifact: {0}")]
    Write(#[source] io::Error),
    #[error("artifact larger than {max} bytes")]
    TooLarge { max: u64 },
    #[error("extraction task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct ArtifactExtractor {
    artifact: String,
    default_dir: PathBuf,
}

impl ArtifactExtractor {
    pub fn new(artifact: impl Into<String>, default_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            default_dir: default_dir.into(),
        }
    }
}

#[async_trait]
impl PartTransform for ArtifactExtractor {
    fn name(&self) -> &'static str {
        "artifact"
    }

    fn applies(&self, ctx: &PartContext<'_>) -> bool {
        ctx.preauth.process_artifact
    }

    async fn transform(&self, input: ByteStream, ctx: &PartContext<'_>) -> Result<ByteStream, TransformError> {
        let dir = ctx
            .preauth
            .temp_path
            .clone()
            .unwrap_or_else(|| self.default_dir.clone());
        let spool_path = dir.join(format!("spool-{}.zip", Uuid::new_v4().simple()));

        let extracted = match spool(input, &spool_path).await {
            Ok(()) => {
                let artifact = self.artifact.clone();
                let out_path = dir.join(format!("artifact-{}", Uuid::new_v4().simple()));
                let archive = spool_path.clone();
                let max = ctx.preauth.maximum_size;
                tokio::task::spawn_blocking(move || extract(&archive, &artifact, &out_path, max))
                    .await
                    .map_err(ExtractError::from)
                    .and_then(|r| r)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&spool_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    path = ?spool_path,
                    error = %e,
                    "Failed to remove spooled archive"
                );
            }
        }

        let file = extracted?;
        Ok(bytestream::from_reader(tokio::fs::File::from_std(file)))
    }
}

async fn spool(mut input: ByteStream, path: &Path) -> Result<(), ExtractError> {
    let spool_error = |source| ExtractError::Spool {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(spool_error)?;
    }
    let mut file = tokio::fs::File::create(path).await.map_err(spool_error)?;
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(ExtractError::Read)?;
        file.write_all(&chunk).await.map_err(spool_error)?;
    }
    file.flush().await.map_err(spool_error)
}

/// Copy entry `artifact` of the zip at `archive` into `out_path`, and return
/// it opened for reading with the path already unlinked.
///
/// At most `max` bytes are decompressed. The header's declared size is
/// checked first, but the copy itself is bounded since headers can lie.
fn extract(archive: &Path, artifact: &str, out_path: &Path, max: Option<u64>) -> Result<fs::File, ExtractError> {
    let mut archive = ZipArchive::new(fs::File::open(archive).map_err(ExtractError::Write)?)?;
    let entry = match archive.by_name(artifact) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(ExtractError::MissingArtifact(artifact.to_string())),
        Err(e) => return Err(e.into()),
    };
    if let Some(max) = max {
        if entry.size() > max {
            return Err(ExtractError::TooLarge { max });
        }
    }

    let mut out = fs::File::create(out_path).map_err(ExtractError::Write)?;
    let mut limited = entry.take(max.map_or(u64::MAX, |m| m.saturating_add(1)));
    let copied = io::copy(&mut limited, &mut out);
    let reopened = copied.and_then(|n| fs::File::open(out_path).map(|f| (n, f)));
    let removed = fs::remove_file(out_path);
    let (written, file) = reopened.map_err(ExtractError::Write)?;
    removed.map_err(ExtractError::Write)?;

    match max {
        Some(max) if written > max => Err(ExtractError::TooLarge { max }),
        _ => Ok(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::preauth::Preauth;
    use bytes::Bytes;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn preauth(dir: &Path) -> Preauth {
        Preauth {
            temp_path: Some(dir.to_path_buf()),
            process_artifact: true,
            maximum_size: None,
        }
    }

    fn ctx(preauth: &Preauth) -> PartContext<'_> {
        PartContext {
            field: "file",
            filename: "dump.zip",
            preauth,
            request_id: "test",
        }
    }

    #[tokio::test]
    async fn extracts_named_entry_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ArtifactExtractor::new("dump.lsif", dir.path());
        let preauth = preauth(dir.path());
        let zip = archive(&[("other.txt", b"x"), ("dump.lsif", b"{\"id\":1}")]);

        let out = extractor
            .transform(bytestream::once(zip), &ctx(&preauth))
            .await
            .unwrap();
        assert_eq!(&bytestream::collect(out).await.unwrap()[..], b"{\"id\":1}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ArtifactExtractor::new("dump.lsif", dir.path());
        let preauth = preauth(dir.path());
        let zip = archive(&[("other.txt", b"x")]);

        let err = extractor
            .transform(bytestream::once(zip), &ctx(&preauth))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TransformError::Extract(ExtractError::MissingArtifact(ref name)) if name == "dump.lsif"
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn artifact_over_maximum_size_is_rejected_early() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ArtifactExtractor::new("dump.lsif", dir.path());
        let preauth = Preauth {
            maximum_size: Some(1024),
            ..preauth(dir.path())
        };
        // compresses to a few hundred bytes
        let zip = archive(&[("dump.lsif", &vec![b'a'; 1 << 18])]);
        assert!(zip.len() < 1024);

        let err = extractor
            .transform(bytestream::once(zip), &ctx(&preauth))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TransformError::Extract(ExtractError::TooLarge { max: 1024 })
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn extraction_is_bounded_by_maximum_size() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        fs::write(&zip_path, archive(&[("dump.lsif", &[b'a'; 4096])])).unwrap();

        let within = extract(&zip_path, "dump.lsif", &dir.path().join("ok"), Some(4096)).unwrap();
        assert_eq!(within.metadata().unwrap().len(), 4096);

        let err = extract(&zip_path, "dump.lsif", &dir.path().join("big"), Some(100)).unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { max: 100 }));
        assert!(!dir.path().join("big").exists());
    }

    #[test]
    fn applies_only_when_requested() {
        let extractor = ArtifactExtractor::new("dump.lsif", "/tmp");
        let granted = Preauth {
            process_artifact: true,
            ..Preauth::default()
        };
        assert!(extractor.applies(&ctx(&granted)));
        assert!(!extractor.applies(&ctx(&Preauth::default())));
    }
}
