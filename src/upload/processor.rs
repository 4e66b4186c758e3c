//! Per-route hooks run while a form is rewritten.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::storage::StoredFile;
use crate::upload::form::MultipartWriter;

/// Header listing the file fields that were replaced, as a JSON object of
/// field name to stored path.
pub const X_MULTIPART_FIELDS: &str = "x-multipart-fields";

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("encode rewritten fields: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] axum::http::header::InvalidHeaderValue),
}

/// Hooks a form rewrite calls into. One instance per request.
#[async_trait]
pub trait MultipartFormProcessor: Send {
    /// Label used in metrics.
    fn name(&self) -> &str;

    /// Called after a non-file part has been copied.
    async fn process_field(&mut self, name: &str, writer: &mut MultipartWriter) -> Result<(), ProcessorError>;

    /// Called after a file part has been stored and its fields written.
    async fn process_file(
        &mut self,
        name: &str,
        file: &StoredFile,
        writer: &mut MultipartWriter,
    ) -> Result<(), ProcessorError>;

    /// Called once the form is complete, before the request is forwarded.
    fn finalize(&mut self, headers: &mut HeaderMap) -> Result<(), ProcessorError>;
}

/// Records which file fields were stored and where.
#[derive(Debug)]
pub struct SavedFileTracker {
    name: String,
    rewritten: BTreeMap<String, String>,
}

impl SavedFileTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rewritten: BTreeMap::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.rewritten.len()
    }
}

#[async_trait]
impl MultipartFormProcessor for SavedFileTracker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_field(&mut self, _name: &str, _writer: &mut MultipartWriter) -> Result<(), ProcessorError> {
        Ok(())
    }

    async fn process_file(
        &mut self,
        name: &str,
        file: &StoredFile,
        _writer: &mut MultipartWriter,
    ) -> Result<(), ProcessorError> {
        self.rewritten.insert(
            name.to_string(),
            file.local_path.to_string_lossy().into_owned(),
        );
        Ok(())
    }

    fn finalize(&mut self, headers: &mut HeaderMap) -> Result<(), ProcessorError> {
        let fields = serde_json::to_string(&self.rewritten)?;
        headers.insert(
            HeaderName::from_static(X_MULTIPART_FIELDS),
            HeaderValue::from_str(&fields)?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn stored(path: &str) -> StoredFile {
        StoredFile {
            name: "x.png".into(),
            local_path: PathBuf::from(path),
            size: 1,
            sha256: String::new(),
            upload_duration: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn tracks_files_and_writes_header() {
        let mut tracker = SavedFileTracker::new("uploads");
        let mut writer = MultipartWriter::new();
        tracker
            .process_file("avatar", &stored("/tmp/a"), &mut writer)
            .await
            .unwrap();
        assert_eq!(tracker.count(), 1);

        let mut headers = HeaderMap::new();
        tracker.finalize(&mut headers).unwrap();
        assert_eq!(headers[X_MULTIPART_FIELDS], r#"{"avatar":"/tmp/a"}"#);
    }
}
