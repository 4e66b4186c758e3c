//! File storage for uploaded parts.
//!
//! The rewriter only needs "persist these bytes, tell me how to reference
//! them". [`FileStore`] is that seam; [`local::LocalFileStore`] writes to
//! disk.

pub mod local;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::bytestream::ByteStream;

pub use local::LocalFileStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity is too large")]
    EntityTooLarge,
    /// The input stream failed; the inner error says why.
    #[error("reading upload: {0}")]
    Read(#[source] io::Error),
    #[error("writing {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where and how to persist one file.
#[derive(Debug, Clone)]
pub struct SaveOpts {
    pub dir: PathBuf,
    /// Prepended to the generated file name, usually the client filename.
    pub prefix: String,
    pub max_size: Option<u64>,
}

/// A persisted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Client-supplied filename.
    pub name: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub upload_duration: Duration,
}

impl StoredFile {
    /// Form fields describing this file under `field`, in a stable order.
    pub fn finalize_fields(&self, field: &str) -> Vec<(String, String)> {
        vec![
            (format!("{field}.name"), self.name.clone()),
            (
                format!("{field}.path"),
                self.local_path.to_string_lossy().into_owned(),
            ),
            (format!("{field}.size"), self.size.to_string()),
            (format!("{field}.sha256"), self.sha256.clone()),
            (
                format!("{field}.upload_duration"),
                self.upload_duration.as_secs_f64().to_string(),
            ),
        ]
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `stream`. `size_hint` is `None` when the length is unknown.
    async fn save(
        &self,
        name: &str,
        stream: ByteStream,
        size_hint: Option<u64>,
        opts: &SaveOpts,
    ) -> Result<StoredFile, StoreError>;
}
