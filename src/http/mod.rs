//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, timeout)
//!     → upload route?  → crate::upload (rewrite multipart, forward)
//!     → otherwise      → upstream.rs (forward)
//!     → senddata.rs (X-Send-Data directive?) → crate::imageresizer
//!     → response.rs (error answers)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod senddata;
pub mod server;
pub mod upstream;

pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer, ServerError};
pub use upstream::{Upstream, UpstreamError};
