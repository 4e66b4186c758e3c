//! Forward-only byte streams shared by the image and upload paths.

use std::io;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// A boxed, owned stream of body chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Stream the contents of an async reader.
pub fn from_reader<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::new(reader).boxed()
}

pub fn empty() -> ByteStream {
    stream::empty().boxed()
}

/// A stream yielding `bytes` once (nothing if empty).
pub fn once(bytes: Bytes) -> ByteStream {
    if bytes.is_empty() {
        empty()
    } else {
        stream::once(async move { Ok(bytes) }).boxed()
    }
}

/// Collect a stream into memory. Test and small-payload helper.
pub async fn collect(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(out))
}
