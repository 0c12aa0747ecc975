//! Opaque continuation tokens for paged listings.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use unistore_core::{ResourceError, ResourceKey, ResourceResult, Version};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    /// Last key served; the next page starts strictly after it.
    pub start_after: ResourceKey,
    /// Store version observed when the first page was served.
    pub rv: Version,
}

impl ContinueToken {
    pub fn encode(&self) -> ResourceResult<String> {
        let raw = serde_json::to_vec(self).map_err(|e| ResourceError::Storage(format!("encoding continue token: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn decode(token: &str) -> ResourceResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|e| ResourceError::Validation(format!("invalid continue token: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| ResourceError::Validation(format!("invalid continue token: {}", e)))
    }
}
