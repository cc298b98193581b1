//! Message types carried on the email request queue.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Email delivery request decoded from one broker message.
///
/// Unknown JSON fields are ignored. Missing fields decode as empty strings,
/// but a request without a recipient is rejected by [`EmailRequest::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    /// Recipient email address
    #[serde(default)]
    pub to: String,
    /// Email subject
    #[serde(default)]
    pub subject: String,
    /// Plain text body
    #[serde(default)]
    pub body: String,
}

impl EmailRequest {
    /// Decode a raw message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let request: Self = serde_json::from_slice(payload)?;

        if request.to.trim().is_empty() {
            return Err(DecodeError::MissingRecipient);
        }

        Ok(request)
    }
}
