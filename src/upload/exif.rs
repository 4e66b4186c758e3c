//! Stripping metadata from image uploads with exiftool.
//!
//! The part is piped through `exiftool ... -` and the cleaned bytes come out
//! of its stdout. If exiftool fails, the stream ends with an error that
//! [`is_removal_failure`] recognises, so the rewriter can answer 422.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::bytestream::{self, ByteStream};
use crate::upload::dispatch::{PartContext, PartTransform, TransformError};

const EXIF_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".tiff"];

/// Remove everything except tags needed to render the image correctly.
const EXIFTOOL_ARGS: &[&str] = &[
    "-all=",
    "--IPTC:all",
    "--XMP-iptcExt:all",
    "-tagsFromFile",
    "@",
    "-ResolutionUnit",
    "-XResolution",
    "-YResolution",
    "-YCbCrSubSampling",
    "-YCbCrPositioning",
    "-BitsPerSample",
    "-ImageHeight",
    "-ImageWidth",
    "-ImageSize",
    "-Copyright",
    "-CopyrightNotice",
    "-Orientation",
    "-",
];

#[derive(Debug, thiserror::Error)]
#[error("error while removing EXIF")]
pub struct MetadataRemovalFailed;

/// Whether `err` came from a failed metadata strip.
pub fn is_removal_failure(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<MetadataRemovalFailed>())
}

fn removal_failed() -> io::Error {
    io::Error::other(MetadataRemovalFailed)
}

pub fn is_exif_file(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    EXIF_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

pub struct ExifStripper {
    program: String,
}

impl ExifStripper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl PartTransform for ExifStripper {
    fn name(&self) -> &'static str {
        "exif"
    }

    fn applies(&self, ctx: &PartContext<'_>) -> bool {
        is_exif_file(ctx.filename)
    }

    async fn transform(&self, input: ByteStream, ctx: &PartContext<'_>) -> Result<ByteStream, TransformError> {
        let spawn_error = |source| TransformError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(EXIFTOOL_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout not captured")))?;

        tracing::debug!(request_id = %ctx.request_id, filename = %ctx.filename, "Running exiftool");
        Ok(cleaned(child, tokio::spawn(pump(input, stdin)), bytestream::from_reader(stdout)))
    }
}

async fn pump(mut input: ByteStream, mut stdin: ChildStdin) -> io::Result<()> {
    while let Some(chunk) = input.next().await {
        let chunk = chunk?;
        match stdin.write_all(&chunk).await {
            Ok(()) => {}
            // exiftool gave up; its exit status reports why
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    stdin.shutdown().await
}

struct Cleaning {
    stdout: ByteStream,
    child: Option<Child>,
    feeder: Option<JoinHandle<io::Result<()>>>,
}

impl Drop for Cleaning {
    fn drop(&mut self) {
        if let Some(feeder) = &self.feeder {
            feeder.abort();
        }
    }
}

/// Stdout of `child`, ending in an error unless both exiftool and the
/// feeder succeeded.
fn cleaned(child: Child, feeder: JoinHandle<io::Result<()>>, stdout: ByteStream) -> ByteStream {
    let state = Cleaning {
        stdout,
        child: Some(child),
        feeder: Some(feeder),
    };

    stream::unfold(state, |mut st| async move {
        st.child.as_ref()?;
        match st.stdout.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), st)),
            Some(Err(e)) => {
                st.child = None;
                tracing::warn!(error = %e, "Reading exiftool output failed");
                Some((Err(removal_failed()), st))
            }
            None => {
                let mut child = st.child.take()?;
                let status = child.wait().await;
                let fed = match st.feeder.take() {
                    Some(feeder) => feeder.await.unwrap_or_else(|e| Err(io::Error::other(e))),
                    None => Ok(()),
                };
                if let Err(e) = fed {
                    // the part itself could not be read
                    return Some((Err(e), st));
                }
                match status {
                    Ok(status) if status.success() => None,
                    Ok(status) => {
                        tracing::warn!(status = %status, "exiftool failed");
                        Some((Err(removal_failed()), st))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Waiting for exiftool failed");
                        Some((Err(removal_failed()), st))
                    }
                }
            }
        }
    })
    .boxed()
}
