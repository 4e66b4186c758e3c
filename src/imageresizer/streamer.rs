//! Streaming the chosen image to the client.
//!
//! Nothing is committed until the first byte is available. A failure before
//! that point is still answerable: a failed scaler falls back to the
//! original, and a broken original becomes a 500. Once a byte is out the
//! status line is gone, so later failures are logged and the body is cut.

use std::io;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, response::Parts, Response},
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::bytestream::{self, ByteStream};
use crate::http::response::fail_500;
use crate::imageresizer::scaler::{Feed, ResizeError, ScalerProcess, ScalerRun};

/// The stream chosen for the client.
pub enum ScaledOutput {
    Original(ByteStream),
    Scaled(ScalerRun),
}

/// Fields attached to every log line about one resize request.
#[derive(Debug, Clone)]
pub struct ResizeLog {
    pub request_id: String,
    pub start: Instant,
    pub width: u32,
    pub content_type: String,
    pub original_filesize: Option<u64>,
}

impl ResizeLog {
    pub fn degraded(&self, err: &ResizeError) {
        tracing::warn!(
            request_id = %self.request_id,
            target_width = self.width,
            content_type = %self.content_type,
            original_filesize = ?self.original_filesize,
            error = %err,
            "ImageResizer: serving original image"
        );
    }

    fn success(&self, bytes_written: u64) {
        tracing::info!(
            request_id = %self.request_id,
            bytes_written,
            duration_s = self.start.elapsed().as_secs_f64(),
            target_width = self.width,
            content_type = %self.content_type,
            original_filesize = ?self.original_filesize,
            "ImageResizer: Success"
        );
    }

    fn late_failure(&self, bytes_written: u64, err: &dyn std::fmt::Display) {
        tracing::error!(
            request_id = %self.request_id,
            bytes_written,
            duration_s = self.start.elapsed().as_secs_f64(),
            target_width = self.width,
            content_type = %self.content_type,
            original_filesize = ?self.original_filesize,
            error = %err,
            "ImageResizer: response truncated"
        );
    }
}

enum Start {
    Data(Bytes, ByteStream),
    Empty,
    Failed(io::Error),
}

async fn start(mut stream: ByteStream) -> Start {
    loop {
        match stream.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => return Start::Data(chunk, stream),
            Some(Err(e)) => return Start::Failed(e),
            None => return Start::Empty,
        }
    }
}

/// Send `output` using the upstream's status and headers.
pub async fn serve(mut head: Parts, output: ScaledOutput, log: ResizeLog) -> Response<Body> {
    // resized length is unknown ahead of time
    head.headers.remove(header::CONTENT_LENGTH);

    match output {
        ScaledOutput::Original(stream) => serve_original(head, stream, log).await,
        ScaledOutput::Scaled(ScalerRun { output, process }) => match start(output).await {
            Start::Data(first, rest) => commit(head, first, rest, Some(process), log),
            Start::Empty => {
                let finished = process.finish().await;
                match finished.status {
                    Ok(()) => commit(head, Bytes::new(), bytestream::empty(), None, log),
                    Err(e) => fall_back(head, e, finished.feed, log).await,
                }
            }
            Start::Failed(e) => {
                let finished = process.abort().await;
                fall_back(head, ResizeError::Output(e), finished.feed, log).await
            }
        },
    }
}

async fn fall_back(head: Parts, err: ResizeError, feed: Option<Feed>, log: ResizeLog) -> Response<Body> {
    log.degraded(&err);
    match feed.and_then(Feed::into_original) {
        Some(original) => serve_original(head, original, log).await,
        None => fail_500(&log.request_id, &err),
    }
}

async fn serve_original(head: Parts, stream: ByteStream, log: ResizeLog) -> Response<Body> {
    match start(stream).await {
        Start::Data(first, rest) => commit(head, first, rest, None, log),
        Start::Empty => commit(head, Bytes::new(), bytestream::empty(), None, log),
        Start::Failed(e) => fail_500(&log.request_id, &e),
    }
}

struct Committed {
    stream: ByteStream,
    process: Option<ScalerProcess>,
    written: u64,
    log: ResizeLog,
    done: bool,
}

fn commit(
    head: Parts,
    first: Bytes,
    rest: ByteStream,
    process: Option<ScalerProcess>,
    log: ResizeLog,
) -> Response<Body> {
    let state = Committed {
        stream: bytestream::once(first).chain(rest).boxed(),
        process,
        written: 0,
        log,
        done: false,
    };

    let body = stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        match st.stream.next().await {
            Some(Ok(chunk)) => {
                st.written += chunk.len() as u64;
                Some((Ok(chunk), st))
            }
            Some(Err(e)) => {
                st.done = true;
                st.log.late_failure(st.written, &e);
                Some((Err(e), st))
            }
            None => {
                st.done = true;
                if let Some(process) = st.process.take() {
                    if let Err(e) = process.finish().await.status {
                        st.log.late_failure(st.written, &e);
                        return Some((Err(io::Error::other(e)), st));
                    }
                }
                st.log.success(st.written);
                None
            }
        }
    });

    Response::from_parts(head, Body::from_stream(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    fn head() -> Parts {
        let (mut parts, _) = Response::new(()).into_parts();
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        parts
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        parts
    }

    fn log() -> ResizeLog {
        ResizeLog {
            request_id: "test".into(),
            start: Instant::now(),
            width: 10,
            content_type: "image/png".into(),
            original_filesize: Some(10),
        }
    }

    #[tokio::test]
    async fn original_is_streamed_without_length() {
        let stream = bytestream::once(Bytes::from_static(b"0123456789"));
        let response = serve(head(), ScaledOutput::Original(stream), log()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn failure_before_first_byte_is_a_500() {
        let stream = stream::once(async { Err(io::Error::other("boom")) }).boxed();
        let response = serve(head(), ScaledOutput::Original(stream), log()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn failure_after_first_byte_truncates() {
        let stream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("boom")),
        ])
        .boxed();
        let response = serve(head(), ScaledOutput::Original(stream), log()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn scaler_exiting_badly_after_output_cuts_the_body() {
        use crate::config::ImageResizerConfig;
        use crate::imageresizer::{ConcurrencyGate, ImageScaler, ResizeRequest, ScalerContext, SourceImage};
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scale.sh");
        std::fs::write(&path, "#!/bin/sh\ncat >/dev/null; printf partial; exit 3\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gate = Arc::new(ConcurrencyGate::new(1));
        let scaler = ImageScaler::new(
            gate.clone(),
            &ImageResizerConfig {
                scaler_path: path.to_string_lossy().into_owned(),
                max_filesize: 1000,
                ..ImageResizerConfig::default()
            },
        );
        let source = SourceImage {
            stream: bytestream::once(Bytes::from_static(b"0123456789")),
            declared_len: Some(10),
        };
        let params = ResizeRequest {
            location: "/a.png".into(),
            content_type: "image/png".into(),
            width: 10,
        };
        let Ok(run) = scaler.try_resize(source, &params, &ScalerContext::default()) else {
            panic!("scaler should start");
        };

        let response = serve(head(), ScaledOutput::Scaled(run), log()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert_eq!(gate.live(), 0);
    }
}
