use serde::{Deserialize, Serialize};

use crate::http::senddata::{Prefix, SendDataError};

/// Directive prefix for scaled image responses.
pub const SEND_SCALED_IMAGE: Prefix = Prefix("send-scaled-img:");

/// What to scale, and how wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "ContentType")]
    pub content_type: String,
    #[serde(rename = "Width")]
    pub width: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error(transparent)]
    Unpack(#[from] SendDataError),
    #[error("Location is empty")]
    EmptyLocation,
    #[error("ContentType must be set")]
    EmptyContentType,
}

impl ResizeRequest {
    /// Unpack and validate a `send-scaled-img:` directive.
    pub fn unpack(data: &str) -> Result<Self, ParamsError> {
        let params: ResizeRequest = SEND_SCALED_IMAGE.unpack(data)?;
        if params.location.is_empty() {
            return Err(ParamsError::EmptyLocation);
        }
        if params.content_type.is_empty() {
            return Err(ParamsError::EmptyContentType);
        }
        Ok(params)
    }
}
