//! Local disk storage.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::bytestream::ByteStream;
use crate::storage::{FileStore, SaveOpts, StoreError, StoredFile};

/// Stores files under the directory named in [`SaveOpts`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(
        &self,
        name: &str,
        mut stream: ByteStream,
        size_hint: Option<u64>,
        opts: &SaveOpts,
    ) -> Result<StoredFile, StoreError> {
        if let (Some(hint), Some(max)) = (size_hint, opts.max_size) {
            if hint > max {
                return Err(StoreError::EntityTooLarge);
            }
        }

        let start = Instant::now();
        let path = opts
            .dir
            .join(format!("{}-{}", opts.prefix, Uuid::new_v4().simple()));
        let write_error = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&opts.dir).await.map_err(write_error)?;
        let mut file = File::create(&path).await.map_err(write_error)?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let result = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(StoreError::Read)?;
                size += chunk.len() as u64;
                if opts.max_size.is_some_and(|max| size > max) {
                    return Err(StoreError::EntityTooLarge);
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await.map_err(write_error)?;
            }
            file.flush().await.map_err(write_error)
        }
        .await;

        if let Err(e) = result {
            drop(file);
            remove_partial(&path).await;
            return Err(e);
        }

        let sha256 = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        tracing::debug!(path = ?path, size, "Stored upload");
        Ok(StoredFile {
            name: name.to_string(),
            local_path: path,
            size,
            sha256,
            upload_duration: start.elapsed(),
        })
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        tracing::warn!(path = ?path, error = %e, "Failed to remove partial upload");
    }
}
