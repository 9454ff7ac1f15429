//! Opaque state codec
//!
//! The caller's original authorization request is carried through the
//! identity provider's redirect round trip as an opaque, URL-safe `state`
//! value. Encoding is JSON wrapped in base64url (no padding), so the value
//! survives inclusion in a query parameter without further escaping.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use thiserror::Error;

use super::AuthorizationRequest;

/// Opaque state decode failures
#[derive(Debug, Error)]
pub enum StateError {
    /// The value is not valid base64url-wrapped JSON
    #[error("state parameter is not valid encoded data: {0}")]
    Malformed(String),

    /// Decoding succeeded but the request has no client id
    #[error("decoded state is missing the client id")]
    MissingClientId,
}

/// Encode an authorization request into a URL-safe opaque state value.
///
/// Never fails for requests produced by this system: every field is a
/// string or a JSON value with string keys.
#[must_use]
pub fn encode(request: &AuthorizationRequest) -> String {
    let json = serde_json::to_vec(request).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode an opaque state value back into the original request.
///
/// # Errors
///
/// [`StateError::Malformed`] if the value is not valid encoded data,
/// [`StateError::MissingClientId`] if it decodes but carries no client id.
pub fn decode(state: &str) -> Result<AuthorizationRequest, StateError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state)
        .map_err(|e| StateError::Malformed(e.to_string()))?;

    let request: AuthorizationRequest =
        serde_json::from_slice(&bytes).map_err(|e| StateError::Malformed(e.to_string()))?;

    if request.client_id.is_empty() {
        return Err(StateError::MissingClientId);
    }

    Ok(request)
}
