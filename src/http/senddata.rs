//! Send-data directives.
//!
//! The upstream asks the proxy to produce a response body on its behalf by
//! setting `X-Send-Data: <prefix><payload>`, where the payload is URL-safe
//! base64 over a JSON object. The upstream is trusted to have signed and
//! produced the value; a payload that fails to unpack is a protocol bug.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::de::DeserializeOwned;

/// Response header carrying a directive.
pub const X_SEND_DATA: &str = "x-send-data";

#[derive(Debug, thiserror::Error)]
pub enum SendDataError {
    #[error("send data does not start with {0:?}")]
    Prefix(&'static str),
    #[error("decode base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decode json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A directive family identified by its prefix.
#[derive(Debug, Clone, Copy)]
pub struct Prefix(pub &'static str);

impl Prefix {
    pub fn matches(&self, data: &str) -> bool {
        data.starts_with(self.0)
    }

    pub fn unpack<T: DeserializeOwned>(&self, data: &str) -> Result<T, SendDataError> {
        let encoded = data
            .strip_prefix(self.0)
            .ok_or(SendDataError::Prefix(self.0))?;
        let json = match URL_SAFE.decode(encoded) {
            Ok(json) => json,
            Err(_) => URL_SAFE_NO_PAD.decode(encoded)?,
        };
        Ok(serde_json::from_slice(&json)?)
    }

    /// Encode `value` the way the upstream does.
    pub fn pack<T: serde::Serialize>(&self, value: &T) -> Result<String, SendDataError> {
        let json = serde_json::to_vec(value)?;
        Ok(format!("{}{}", self.0, URL_SAFE.encode(json)))
    }
}
