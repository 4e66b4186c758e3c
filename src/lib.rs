//! Intercepting reverse proxy library.
//!
//! Sits in front of one upstream application server. Most traffic is
//! forwarded unchanged; two kinds are handled here:
//! - responses carrying a `send-scaled-img:` directive get their body
//!   replaced by a scaled image from an external scaler process
//! - multipart uploads on configured routes have their file parts stored
//!   and replaced by metadata fields before the form is forwarded

pub mod bytestream;
pub mod config;
pub mod http;
pub mod imageresizer;
pub mod lifecycle;
pub mod observability;
pub mod storage;
pub mod upload;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
