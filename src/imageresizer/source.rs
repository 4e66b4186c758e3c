//! Opening source images.
//!
//! Images live either on local disk or remotely (object storage), in which
//! case they are streamed over HTTP(S). Either way the caller gets a stream
//! and a declared length that is only a hint: chunked responses have none.

use std::io;
use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;

use crate::bytestream::{self, ByteStream};
use crate::config::FetchConfig;

/// An opened source image.
pub struct SourceImage {
    pub stream: ByteStream,
    /// Length from `Content-Length` or file metadata, if known.
    pub declared_len: Option<u64>,
}

impl std::fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceImage")
            .field("declared_len", &self.declared_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot read data from {location:?}: {status}")]
    Status { location: String, status: StatusCode },
    #[error("connecting to {location:?} timed out")]
    ConnectTimeout { location: String },
    #[error("no response headers from {location:?} within {timeout:?}")]
    HeaderTimeout { location: String, timeout: Duration },
    #[error("fetching {location:?}: {source}")]
    Fetch {
        location: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("opening {path:?}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Opens source images from disk or over HTTP.
#[derive(Debug, Clone)]
pub struct SourceImageOpener {
    client: reqwest::Client,
    header_timeout: Duration,
}

impl SourceImageOpener {
    /// Build the outbound client. Proxy settings come from the environment.
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .tcp_keepalive(Duration::from_secs(config.tcp_keepalive_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            header_timeout: Duration::from_secs(config.response_header_timeout_secs),
        })
    }

    pub async fn open(&self, location: &str) -> Result<SourceImage, SourceError> {
        if is_url(location) {
            self.open_url(location).await
        } else {
            open_file(location).await
        }
    }

    async fn open_url(&self, location: &str) -> Result<SourceImage, SourceError> {
        let send = self.client.get(location).send();
        let response = match tokio::time::timeout(self.header_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(SourceError::ConnectTimeout {
                    location: location.to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(SourceError::Fetch {
                    location: location.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(SourceError::HeaderTimeout {
                    location: location.to_string(),
                    timeout: self.header_timeout,
                })
            }
        };

        if response.status() != StatusCode::OK {
            return Err(SourceError::Status {
                location: location.to_string(),
                status: response.status(),
            });
        }

        let declared_len = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(SourceImage {
            stream,
            declared_len,
        })
    }
}

async fn open_file(path: &str) -> Result<SourceImage, SourceError> {
    let file_error = |source| SourceError::File {
        path: path.to_string(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(file_error)?;
    let metadata = file.metadata().await.map_err(file_error)?;

    Ok(SourceImage {
        stream: bytestream::from_reader(file),
        declared_len: Some(metadata.len()),
    })
}
