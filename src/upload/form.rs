//! Writing the rewritten multipart body.
//!
//! The output always uses a fresh boundary. It is buffered in memory; file
//! contents never pass through here, only their metadata fields.

use axum::http::HeaderMap;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub struct MultipartWriter {
    boundary: String,
    buf: BytesMut,
    parts: usize,
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartWriter {
    pub fn new() -> Self {
        Self::with_boundary(Uuid::new_v4().simple().to_string())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buf: BytesMut::new(),
            parts: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the rewritten request's `Content-Type`.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Start a part with `headers`. Follow with [`write`](Self::write).
    pub fn begin_part(&mut self, headers: &HeaderMap) {
        self.delimiter();
        for (name, value) in headers {
            self.buf.put_slice(name.as_str().as_bytes());
            self.buf.put_slice(b": ");
            self.buf.put_slice(value.as_bytes());
            self.buf.put_slice(b"\r\n");
        }
        self.buf.put_slice(b"\r\n");
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Write a complete plain field.
    pub fn write_field(&mut self, name: &str, value: &str) {
        self.delimiter();
        self.buf.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(name)
            )
            .as_bytes(),
        );
        self.buf.put_slice(value.as_bytes());
    }

    /// Close the body and return it.
    pub fn finish(mut self) -> Bytes {
        if self.parts > 0 {
            self.buf.put_slice(b"\r\n");
        }
        self.buf
            .put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.buf.freeze()
    }

    fn delimiter(&mut self) {
        if self.parts > 0 {
            self.buf.put_slice(b"\r\n");
        }
        self.buf
            .put_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.parts += 1;
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
