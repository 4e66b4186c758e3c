//! Scaler orchestration.
//!
//! ```text
//! Start → SizeCheck → [TooLarge]
//!       → SlotCheck → [TooManyScalers]
//!       → Spawn     → [Spawn]
//!       → Streaming → [Resized]
//! ```
//!
//! Every rejection hands the untouched source back inside a [`Fallback`], so
//! the caller can always serve the original image.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::bytestream::{self, ByteStream};
use crate::config::ImageResizerConfig;
use crate::imageresizer::gate::{ConcurrencyGate, ScalerPermit};
use crate::imageresizer::params::ResizeRequest;
use crate::imageresizer::source::SourceImage;
use crate::observability::metrics;

pub const WIDTH_ENV: &str = "RESIZE_IMAGE_WIDTH";
pub const CONTENT_TYPE_ENV: &str = "RESIZE_IMAGE_CONTENT_TYPE";

#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("{size}b exceeds maximum file size of {max}b")]
    TooLarge { size: u64, max: u64 },
    #[error("too many running scaler processes")]
    TooManyScalers,
    #[error("failed forking into scaler process: {0}")]
    Spawn(#[source] io::Error),
    #[error("reading source image: {0}")]
    Source(#[source] io::Error),
    #[error("feeding scaler: {0}")]
    Stdin(#[source] io::Error),
    #[error("reading scaler output: {0}")]
    Output(#[source] io::Error),
    #[error("waiting for scaler: {0}")]
    Wait(#[source] io::Error),
    #[error("scaler exited with {0}")]
    Exit(ExitStatus),
}

/// A declined resize: the original source plus the reason.
pub struct Fallback {
    pub source: ByteStream,
    pub reason: ResizeError,
}

/// Per-request inputs to the scaler that do not come from the directive.
#[derive(Debug, Clone, Default)]
pub struct ScalerContext {
    pub request_id: String,
    /// Trace context variables for the child environment.
    pub env: Vec<(String, String)>,
}

/// Decides whether to resize and starts the scaler.
#[derive(Debug, Clone)]
pub struct ImageScaler {
    gate: Arc<ConcurrencyGate>,
    scaler_path: String,
    max_filesize: u64,
}

impl ImageScaler {
    pub fn new(gate: Arc<ConcurrencyGate>, config: &ImageResizerConfig) -> Self {
        Self {
            gate,
            scaler_path: config.scaler_path.clone(),
            max_filesize: config.max_filesize,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Attempt to start a resize of `source`.
    pub fn try_resize(
        &self,
        source: SourceImage,
        params: &ResizeRequest,
        ctx: &ScalerContext,
    ) -> Result<ScalerRun, Fallback> {
        if let Some(size) = source.declared_len {
            if size > self.max_filesize {
                return Err(Fallback {
                    source: source.stream,
                    reason: ResizeError::TooLarge {
                        size,
                        max: self.max_filesize,
                    },
                });
            }
        }

        let Some(permit) = self.gate.try_acquire() else {
            return Err(Fallback {
                source: source.stream,
                reason: ResizeError::TooManyScalers,
            });
        };

        let mut child = match self.command(params, ctx).spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(Fallback {
                    source: source.stream,
                    reason: ResizeError::Spawn(e),
                })
            }
        };

        // All three pipes were requested above.
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Fallback {
                source: source.stream,
                reason: ResizeError::Spawn(io::Error::other("scaler pipes unavailable")),
            });
        };

        let pgid = child.id();
        let feeder = tokio::spawn(feed_scaler(source.stream, stdin, self.max_filesize, pgid));
        let stderr = tokio::spawn(log_scaler_stderr(stderr, ctx.request_id.clone()));

        tracing::debug!(
            request_id = %ctx.request_id,
            pid = ?pgid,
            width = params.width,
            content_type = %params.content_type,
            "Scaler process started"
        );

        Ok(ScalerRun {
            output: bytestream::from_reader(stdout),
            process: ScalerProcess {
                child,
                pgid,
                feeder: Some(feeder),
                stderr: Some(stderr),
                reaped: false,
                _permit: permit,
            },
        })
    }

    fn command(&self, params: &ResizeRequest, ctx: &ScalerContext) -> Command {
        let mut command = Command::new(&self.scaler_path);
        command.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
            .env(WIDTH_ENV, params.width.to_string())
            .env(CONTENT_TYPE_ENV, &params.content_type)
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }
}

/// A started scaler: its output and the process that produces it.
pub struct ScalerRun {
    pub output: ByteStream,
    pub process: ScalerProcess,
}

/// What the feeder did with the source image.
pub struct Feed {
    /// Every source byte read so far.
    pub replay: Bytes,
    /// Source bytes not yet read.
    pub rest: Option<ByteStream>,
    pub error: Option<ResizeError>,
}

impl Feed {
    /// Rebuild the original image, unless the source itself broke.
    pub fn into_original(self) -> Option<ByteStream> {
        if matches!(self.error, Some(ResizeError::Source(_))) {
            return None;
        }
        let head = bytestream::once(self.replay);
        Some(match self.rest {
            Some(rest) => head.chain(rest).boxed(),
            None => head,
        })
    }
}

/// Outcome of a finished scaler.
pub struct Finished {
    pub status: Result<(), ResizeError>,
    pub feed: Option<Feed>,
}

/// A running scaler process. Holds its concurrency slot for as long as it
/// lives and kills its whole process group if dropped before being reaped.
pub struct ScalerProcess {
    child: Child,
    pgid: Option<u32>,
    feeder: Option<JoinHandle<Feed>>,
    stderr: Option<JoinHandle<()>>,
    reaped: bool,
    _permit: ScalerPermit,
}

impl ScalerProcess {
    /// Wait for the scaler to exit and for its input to drain.
    pub async fn finish(mut self) -> Finished {
        // Leftover grandchildren must not outlive the request. The leader is
        // not reaped yet, so the group id still belongs to this scaler.
        self.signal_group(libc::SIGTERM);
        let wait = self.child.wait().await;
        self.reaped = true;

        let feed = match self.feeder.take() {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        if let Some(handle) = self.stderr.take() {
            let _ = handle.await;
        }

        let status = match wait {
            Err(e) => Err(ResizeError::Wait(e)),
            Ok(status) if !status.success() => Err(ResizeError::Exit(status)),
            Ok(_) => match feed.as_ref().and_then(|f| f.error.as_ref()) {
                Some(ResizeError::TooLarge { size, max }) => Err(ResizeError::TooLarge {
                    size: *size,
                    max: *max,
                }),
                Some(ResizeError::Source(e)) => {
                    Err(ResizeError::Source(io::Error::new(e.kind(), e.to_string())))
                }
                _ => {
                    metrics::record_resize_completed();
                    Ok(())
                }
            },
        };

        Finished { status, feed }
    }

    /// Kill the scaler group, then collect what is left.
    pub async fn abort(self) -> Finished {
        self.signal_group(libc::SIGKILL);
        self.finish().await
    }

    fn signal_group(&self, signal: libc::c_int) {
        signal_group(self.pgid, signal);
    }
}

fn signal_group(pgid: Option<u32>, signal: libc::c_int) {
    if let Some(pgid) = pgid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: killpg only sends a signal; a stale group yields ESRCH.
        unsafe {
            libc::killpg(pgid, signal);
        }
    }
}

impl Drop for ScalerProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.feeder.take() {
            handle.abort();
        }
        if !self.reaped {
            self.signal_group(libc::SIGKILL);
        }
    }
}

/// Copy the source into the scaler, keeping a replay copy so the original
/// can still be served if the scaler fails before producing output.
async fn feed_scaler(mut source: ByteStream, mut stdin: ChildStdin, max_filesize: u64, pgid: Option<u32>) -> Feed {
    let mut replay = BytesMut::new();
    loop {
        let chunk = match source.next().await {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                return Feed {
                    replay: replay.freeze(),
                    rest: None,
                    error: Some(ResizeError::Source(e)),
                }
            }
        };
        replay.extend_from_slice(&chunk);

        // the declared size is only a hint
        let size = replay.len() as u64;
        if size > max_filesize {
            // stop the scaler before it turns a truncated input into output
            signal_group(pgid, libc::SIGKILL);
            return Feed {
                replay: replay.freeze(),
                rest: Some(source),
                error: Some(ResizeError::TooLarge {
                    size,
                    max: max_filesize,
                }),
            };
        }

        if let Err(e) = stdin.write_all(&chunk).await {
            let error = (e.kind() != io::ErrorKind::BrokenPipe).then_some(ResizeError::Stdin(e));
            return Feed {
                replay: replay.freeze(),
                rest: Some(source),
                error,
            };
        }
    }

    let error = stdin.shutdown().await.err().and_then(|e| {
        (e.kind() != io::ErrorKind::BrokenPipe).then_some(ResizeError::Stdin(e))
    });
    Feed {
        replay: replay.freeze(),
        rest: None,
        error,
    }
}

async fn log_scaler_stderr(stderr: ChildStderr, request_id: String) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    while let Ok(Some(line)) = lines.next_segment().await {
        let line = String::from_utf8_lossy(&line);
        tracing::info!(request_id = %request_id, scaler = %line.trim_end(), "Scaler output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn scaler(path: &str, ceiling: u32) -> ImageScaler {
        ImageScaler::new(
            Arc::new(ConcurrencyGate::new(ceiling)),
            &ImageResizerConfig {
                scaler_path: path.to_string(),
                max_filesize: 1000,
                ..ImageResizerConfig::default()
            },
        )
    }

    fn source(bytes: &'static [u8], declared_len: Option<u64>) -> SourceImage {
        SourceImage {
            stream: bytestream::once(Bytes::from_static(bytes)),
            declared_len,
        }
    }

    fn params() -> ResizeRequest {
        ResizeRequest {
            location: "/a.png".into(),
            content_type: "image/png".into(),
            width: 32,
        }
    }

    async fn fallback_bytes(result: Result<ScalerRun, Fallback>) -> (Bytes, ResizeError) {
        match result {
            Ok(_) => panic!("expected a fallback"),
            Err(fallback) => (
                bytestream::collect(fallback.source).await.unwrap(),
                fallback.reason,
            ),
        }
    }

    #[tokio::test]
    async fn oversized_source_falls_back_without_slot() {
        let scaler = scaler("/bin/false", 1);
        let big: &'static [u8] = vec![7u8; 1001].leak();

        let (bytes, reason) =
            fallback_bytes(scaler.try_resize(source(big, Some(1001)), &params(), &ScalerContext::default()))
                .await;
        assert_eq!(&bytes[..], &big[..]);
        assert!(matches!(reason, ResizeError::TooLarge { size: 1001, max: 1000 }));
        assert_eq!(scaler.gate().live(), 0);
        assert_eq!(scaler.gate().rejected(), 0);
    }

    #[tokio::test]
    async fn full_gate_falls_back() {
        let scaler = scaler("/bin/cat", 1);
        let _held = scaler.gate().try_acquire().unwrap();

        let (bytes, reason) =
            fallback_bytes(scaler.try_resize(source(b"img", Some(3)), &params(), &ScalerContext::default()))
                .await;
        assert_eq!(&bytes[..], b"img");
        assert!(matches!(reason, ResizeError::TooManyScalers));
        assert_eq!(scaler.gate().live(), 1);
    }

    #[tokio::test]
    async fn spawn_failure_falls_back_and_frees_slot() {
        let scaler = scaler("/nonexistent/resize-image", 1);

        let (bytes, reason) =
            fallback_bytes(scaler.try_resize(source(b"img", Some(3)), &params(), &ScalerContext::default()))
                .await;
        assert_eq!(&bytes[..], b"img");
        assert!(matches!(reason, ResizeError::Spawn(_)));
        assert_eq!(scaler.gate().live(), 0);
    }

    #[tokio::test]
    async fn scaler_sees_params_in_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "scale.sh",
            r#"cat >/dev/null; printf '%s|%s|%s' "$RESIZE_IMAGE_WIDTH" "$RESIZE_IMAGE_CONTENT_TYPE" "$CORRELATION_ID""#,
        );
        let scaler = scaler(&path, 1);
        let ctx = ScalerContext {
            request_id: "req-9".into(),
            env: vec![("CORRELATION_ID".into(), "req-9".into())],
        };

        let Ok(run) = scaler.try_resize(source(b"img", None), &params(), &ctx) else {
            panic!("scaler should start");
        };
        assert_eq!(scaler.gate().live(), 1);

        let output = bytestream::collect(run.output).await.unwrap();
        assert_eq!(&output[..], b"32|image/png|req-9");

        let finished = run.process.finish().await;
        assert!(finished.status.is_ok());
        assert_eq!(scaler.gate().live(), 0);
    }

    #[tokio::test]
    async fn failed_scaler_keeps_replay_of_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "fail.sh", "cat >/dev/null; exit 3");
        let scaler = scaler(&path, 1);

        let Ok(run) = scaler.try_resize(source(b"original", Some(8)), &params(), &ScalerContext::default()) else {
            panic!("scaler should start");
        };
        assert!(bytestream::collect(run.output).await.unwrap().is_empty());

        let finished = run.process.finish().await;
        assert!(matches!(finished.status, Err(ResizeError::Exit(_))));
        let original = finished.feed.unwrap().into_original().unwrap();
        assert_eq!(&bytestream::collect(original).await.unwrap()[..], b"original");
    }

    #[tokio::test]
    async fn undeclared_oversized_source_is_caught_while_feeding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "scale.sh", "cat >/dev/null; printf out");
        let scaler = scaler(&path, 1);
        let big: &'static [u8] = vec![1u8; 4000].leak();

        let Ok(run) = scaler.try_resize(source(big, None), &params(), &ScalerContext::default()) else {
            panic!("scaler should start");
        };
        let _ = bytestream::collect(run.output).await;

        let finished = run.process.finish().await;
        assert!(finished.status.is_err());
        let feed = finished.feed.unwrap();
        assert!(matches!(feed.error, Some(ResizeError::TooLarge { size: 4000, max: 1000 })));
        let original = feed.into_original().unwrap();
        assert_eq!(&bytestream::collect(original).await.unwrap()[..], &big[..]);
    }

    #[tokio::test]
    async fn finished_scaler_leaves_no_group_members() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let body = format!(
            "cat >/dev/null; (sleep 1; touch {}) >/dev/null 2>&1 & printf out",
            marker.display()
        );
        let path = write_script(dir.path(), "scale.sh", &body);
        let scaler = scaler(&path, 1);

        let Ok(run) = scaler.try_resize(source(b"in", Some(2)), &params(), &ScalerContext::default()) else {
            panic!("scaler should start");
        };
        assert_eq!(&bytestream::collect(run.output).await.unwrap()[..], b"out");
        let finished = run.process.finish().await;
        assert!(finished.status.is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
        assert_eq!(scaler.gate().live(), 0);
    }
}
